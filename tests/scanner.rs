// SPDX-License-Identifier: MIT OR Apache-2.0

//! Startup scan against a sparsely populated simulated bus.

mod sim;

use std::time::Duration;

use anyhow::Result;

use modbus_gateway::{
    arbiter::Arbiter,
    catalog::{self, SlaveCatalog, SlaveEntry},
    frame::ExceptionCode,
    master::Master,
};

use sim::{Behavior, SimSlave};

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);
const FRAME_GAP: Duration = Duration::from_micros(100);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scan_records_units_that_answer() -> Result<()> {
    let (master_io, bus) = tokio::io::duplex(4096);
    SimSlave::new()
        .holding(1, &[(0, 1)])
        .unit(2)
        // A grumpy device is still a present device.
        .unit_with_behavior(3, Behavior::Exception(ExceptionCode::IllegalDataAddress))
        .unit_with_behavior(4, Behavior::Silent)
        .spawn(bus);
    let arbiter = Arbiter::spawn(move || Master::new(master_io, RESPONSE_TIMEOUT, FRAME_GAP));

    let catalog = SlaveCatalog::new([SlaveEntry {
        unit: 1,
        name: "boiler".into(),
        description: String::new(),
    }]);

    let found = catalog::scan(&arbiter.handle(), &catalog, 1..=6).await;
    assert_eq!(found, vec![1, 2, 3]);

    // Configured metadata survives, discoveries get generated names.
    assert_eq!(catalog.get(1).unwrap().name, "boiler");
    assert_eq!(catalog.get(2).unwrap().name, "slave-2");
    assert_eq!(catalog.get(3).unwrap().name, "slave-3");
    assert!(!catalog.contains(4));
    assert!(!catalog.contains(5));
    assert_eq!(catalog.len(), 3);

    arbiter.shutdown().await;
    Ok(())
}
