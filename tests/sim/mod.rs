// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scriptable RTU slave speaking real frames over an in-memory bus

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
use tokio_util::codec::{Decoder as _, Encoder as _};

use modbus_gateway::{
    codec::rtu::SlaveCodec,
    frame::{
        rtu::{RequestFrame, ResponseFrame},
        ExceptionCode, ExceptionResponse, Request, Response,
    },
};

/// How a simulated unit reacts to requests.
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)] // not every test file exercises every behavior
pub enum Behavior {
    /// Serve reads and writes from the data banks.
    Normal,
    /// Never answer; the master runs into its response timeout.
    Silent,
    /// Answer every request with this exception code.
    Exception(ExceptionCode),
    /// Answer correctly but with the last CRC byte flipped.
    CorruptCrc,
}

#[derive(Debug, Default)]
struct Banks {
    coils: HashMap<u16, bool>,
    discrete: HashMap<u16, bool>,
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
}

#[derive(Debug)]
struct Unit {
    behavior: Behavior,
    banks: Banks,
}

/// A bus full of simulated units. Units not present never answer.
#[derive(Debug, Default)]
pub struct SimSlave {
    units: HashMap<u8, Unit>,
}

#[allow(dead_code)] // not every test file uses every builder
impl SimSlave {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(mut self, id: u8) -> Self {
        self.units.insert(
            id,
            Unit {
                behavior: Behavior::Normal,
                banks: Banks::default(),
            },
        );
        self
    }

    pub fn unit_with_behavior(mut self, id: u8, behavior: Behavior) -> Self {
        self.units.insert(
            id,
            Unit {
                behavior,
                banks: Banks::default(),
            },
        );
        self
    }

    pub fn holding(mut self, id: u8, values: &[(u16, u16)]) -> Self {
        let unit = self.units.entry(id).or_insert_with(|| Unit {
            behavior: Behavior::Normal,
            banks: Banks::default(),
        });
        unit.banks.holding.extend(values.iter().copied());
        self
    }

    pub fn coils(mut self, id: u8, values: &[(u16, bool)]) -> Self {
        let unit = self.units.entry(id).or_insert_with(|| Unit {
            behavior: Behavior::Normal,
            banks: Banks::default(),
        });
        unit.banks.coils.extend(values.iter().copied());
        self
    }

    pub fn discrete_inputs(mut self, id: u8, values: &[(u16, bool)]) -> Self {
        let unit = self.units.entry(id).or_insert_with(|| Unit {
            behavior: Behavior::Normal,
            banks: Banks::default(),
        });
        unit.banks.discrete.extend(values.iter().copied());
        self
    }

    pub fn input_registers(mut self, id: u8, values: &[(u16, u16)]) -> Self {
        let unit = self.units.entry(id).or_insert_with(|| Unit {
            behavior: Behavior::Normal,
            banks: Banks::default(),
        });
        unit.banks.input.extend(values.iter().copied());
        self
    }

    pub fn spawn(self, bus: DuplexStream) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(bus))
    }

    async fn run(mut self, mut bus: DuplexStream) {
        let mut codec = SlaveCodec;
        let mut buf = BytesMut::new();
        loop {
            let frame = loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => break frame,
                    Ok(None) => {}
                    Err(_) => return,
                }
                match bus.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            };

            let RequestFrame { slave, request } = frame;
            let Some(unit) = self.units.get_mut(&slave) else {
                continue;
            };
            let function = request.function_code();

            let reply = match unit.behavior {
                Behavior::Silent => continue,
                Behavior::Exception(exception) => Err(ExceptionResponse {
                    function,
                    exception,
                }),
                Behavior::Normal | Behavior::CorruptCrc => Ok(unit.banks.respond(request)),
            };
            let corrupt = matches!(unit.behavior, Behavior::CorruptCrc);

            let mut out = BytesMut::new();
            codec
                .encode(ResponseFrame { slave, reply }, &mut out)
                .expect("encode response");
            if corrupt {
                let last = out.len() - 1;
                out[last] ^= 0xFF;
            }
            if bus.write_all(&out).await.is_err() {
                return;
            }
        }
    }
}

impl Banks {
    fn respond(&mut self, request: Request) -> Response {
        match request {
            Request::ReadCoils(addr, cnt) => Response::ReadCoils(
                (0..cnt)
                    .map(|i| *self.coils.get(&(addr + i)).unwrap_or(&false))
                    .collect(),
            ),
            Request::ReadDiscreteInputs(addr, cnt) => Response::ReadDiscreteInputs(
                (0..cnt)
                    .map(|i| *self.discrete.get(&(addr + i)).unwrap_or(&false))
                    .collect(),
            ),
            Request::ReadHoldingRegisters(addr, cnt) => Response::ReadHoldingRegisters(
                (0..cnt)
                    .map(|i| *self.holding.get(&(addr + i)).unwrap_or(&0))
                    .collect(),
            ),
            Request::ReadInputRegisters(addr, cnt) => Response::ReadInputRegisters(
                (0..cnt)
                    .map(|i| *self.input.get(&(addr + i)).unwrap_or(&0))
                    .collect(),
            ),
            Request::WriteSingleCoil(addr, state) => {
                self.coils.insert(addr, state);
                Response::WriteSingleCoil(addr, state)
            }
            Request::WriteSingleRegister(addr, word) => {
                self.holding.insert(addr, word);
                Response::WriteSingleRegister(addr, word)
            }
            Request::WriteMultipleCoils(addr, states) => {
                for (i, state) in states.iter().enumerate() {
                    self.coils.insert(addr + i as u16, *state);
                }
                Response::WriteMultipleCoils(addr, states.len() as u16)
            }
            Request::WriteMultipleRegisters(addr, words) => {
                for (i, word) in words.iter().enumerate() {
                    self.holding.insert(addr + i as u16, *word);
                }
                Response::WriteMultipleRegisters(addr, words.len() as u16)
            }
            Request::MaskWriteRegister(addr, and_mask, or_mask) => {
                let current = *self.holding.get(&addr).unwrap_or(&0);
                self.holding
                    .insert(addr, (current & and_mask) | (or_mask & !and_mask));
                Response::MaskWriteRegister(addr, and_mask, or_mask)
            }
        }
    }
}
