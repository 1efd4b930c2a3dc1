// SPDX-License-Identifier: MIT OR Apache-2.0

//! The typed operations of the arbiter handle, one per supported
//! function code, against a simulated slave.

mod sim;

use std::time::Duration;

use anyhow::Result;

use modbus_gateway::{arbiter::Arbiter, master::Master, slave::Slave};

use sim::SimSlave;

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);
const FRAME_GAP: Duration = Duration::from_micros(100);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_operation_reaches_the_bus() -> Result<()> {
    let (master_io, bus) = tokio::io::duplex(4096);
    SimSlave::new()
        .unit(1)
        .discrete_inputs(1, &[(0, true), (2, true)])
        .input_registers(1, &[(7, 0x0777)])
        .spawn(bus);
    let arbiter = Arbiter::spawn(move || Master::new(master_io, RESPONSE_TIMEOUT, FRAME_GAP));
    let handle = arbiter.handle();
    let slave = Slave(1);

    handle.write_single_coil(slave, 3, true).await?;
    assert_eq!(
        handle.read_coils(slave, 0, 5).await?,
        vec![false, false, false, true, false]
    );

    handle
        .write_multiple_coils(slave, 10, &[true, true, false, true])
        .await?;
    assert_eq!(
        handle.read_coils(slave, 10, 4).await?,
        vec![true, true, false, true]
    );

    assert_eq!(
        handle.read_discrete_inputs(slave, 0, 3).await?,
        vec![true, false, true]
    );

    handle.write_single_register(slave, 0, 0x1234).await?;
    handle
        .write_multiple_registers(slave, 1, &[0xAAAA, 0x5555])
        .await?;
    assert_eq!(
        handle.read_holding_registers(slave, 0, 3).await?,
        vec![0x1234, 0xAAAA, 0x5555]
    );

    // (0x1234 & 0x00FF) | (0xAB00 & !0x00FF) = 0xAB34
    handle
        .mask_write_register(slave, 0, 0x00FF, 0xAB00)
        .await?;
    assert_eq!(
        handle.read_holding_registers(slave, 0, 1).await?,
        vec![0xAB34]
    );

    assert_eq!(
        handle.read_input_registers(slave, 7, 1).await?,
        vec![0x0777]
    );

    drop(handle);
    arbiter.shutdown().await;
    Ok(())
}
