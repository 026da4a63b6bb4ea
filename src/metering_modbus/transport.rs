use log::debug;
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{MeterConnector, PollError, RegisterSource};

/// Production connector. Every meter read cycle gets its own fresh TCP
/// connection, nothing is pooled or kept alive between cycles.
pub struct ModbusTcp;

pub struct ModbusTcpSource {
    stream: TcpStream,
    addr: String,
}

impl MeterConnector for ModbusTcp {
    type Source = ModbusTcpSource;

    async fn connect(&self, ip: &str, port: u16) -> Result<ModbusTcpSource, PollError> {
        let addr = format!("{ip}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| PollError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        debug!("Connected to meter at {addr}");
        Ok(ModbusTcpSource { stream, addr })
    }
}

impl ModbusTcpSource {
    fn io_error(&self, source: std::io::Error) -> PollError {
        PollError::Io {
            addr: self.addr.clone(),
            source,
        }
    }
}

impl RegisterSource for ModbusTcpSource {
    async fn read_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, PollError> {
        let mut mreq = ModbusRequest::new(unit_id, ModbusProto::TcpUdp);

        let mut request = Vec::new();
        mreq.generate_get_holdings(address, count, &mut request)
            .map_err(|kind| PollError::Request {
                addr: self.addr.clone(),
                kind,
            })?;

        self.stream
            .write_all(&request)
            .await
            .map_err(|e| self.io_error(e))?;

        /* the first 6 bytes are enough to know the full frame length */
        let mut header = [0u8; 6];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|e| self.io_error(e))?;

        let len = guess_response_frame_len(&header, ModbusProto::TcpUdp).map_err(|kind| {
            PollError::Frame {
                addr: self.addr.clone(),
                kind,
            }
        })?;

        let mut response = header.to_vec();
        if len as usize > header.len() {
            let mut rest = vec![0u8; len as usize - header.len()];
            self.stream
                .read_exact(&mut rest)
                .await
                .map_err(|e| self.io_error(e))?;
            response.extend_from_slice(&rest);
        }

        let mut words = Vec::new();
        mreq.parse_u16(&response, &mut words)
            .map_err(|kind| PollError::Frame {
                addr: self.addr.clone(),
                kind,
            })?;
        Ok(words)
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
