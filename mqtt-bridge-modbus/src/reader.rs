//! Modbus TCP register reads.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;

use crate::config::{PointConfig, RegisterKind};

/// Error type for register read operations.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Device exception: {0}")]
    Exception(String),
}

/// Capability to read raw register words for one configured point.
#[async_trait]
pub trait RegisterReader: Send + Sync {
    async fn read(&self, point: &PointConfig) -> Result<Vec<u16>, ReadError>;
}

/// Reader that opens a fresh Modbus TCP connection for every cycle.
///
/// The per-cycle transport is dropped as soon as the read finishes or
/// fails, so a failed cycle can never leave a poisoned connection behind
/// for the next one.
pub struct TcpRegisterReader {
    timeout: Duration,
}

impl TcpRegisterReader {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Connect to the device, selecting the unit id when one is configured.
    async fn connect(&self, point: &PointConfig) -> Result<Context, ReadError> {
        let mut addrs = tokio::net::lookup_host((point.host.as_str(), point.port))
            .await
            .map_err(|e| ReadError::Connect(e.to_string()))?;
        let addr: SocketAddr = addrs.next().ok_or_else(|| {
            ReadError::Connect(format!("no address found for {}:{}", point.host, point.port))
        })?;

        let connect = async {
            match point.slave {
                Some(unit) => tcp::connect_slave(addr, Slave(unit)).await,
                None => tcp::connect(addr).await,
            }
        };

        tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| ReadError::Timeout(self.timeout))?
            .map_err(|e| ReadError::Connect(e.to_string()))
    }
}

#[async_trait]
impl RegisterReader for TcpRegisterReader {
    async fn read(&self, point: &PointConfig) -> Result<Vec<u16>, ReadError> {
        let mut ctx = self.connect(point).await?;

        let request = async {
            match point.register_kind {
                RegisterKind::Holding => {
                    ctx.read_holding_registers(point.address, point.count).await
                }
                RegisterKind::Input => ctx.read_input_registers(point.address, point.count).await,
            }
        };

        // Dropping the context closes the per-cycle connection, on the
        // failure paths as well as after a successful read.
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| ReadError::Timeout(self.timeout))?
            .map_err(|e| ReadError::Transport(e.to_string()))?
            .map_err(|e| ReadError::Exception(format!("{:?}", e)))
    }
}
