//! RFCOMM 连接器
//!
//! 通过 bluer (BlueZ) 的 RFCOMM socket 连接对端的串口服务 (SPP)。
//! 对端固件把 SPP 固定在一个 RFCOMM 信道上（ESP32 BluetoothSerial 默认为 1），
//! 信道号可以在配置中修改。

use log::{debug, info};

use super::{StreamConnector, StreamError, StreamingChannel};
use crate::ble::{PeerLink, SERIAL_PORT_UUID};
use crate::bus::StreamId;
use bluer::Address;
use bluer::rfcomm::{SocketAddr, Stream};

pub struct RfcommConnector {
    address: Address,
    channel: u8,
}

impl RfcommConnector {
    pub fn new(address: Address, channel: u8) -> Self {
        Self { address, channel }
    }

    pub fn for_peer(peer: &PeerLink, channel: u8) -> Result<Self, StreamError> {
        let address: Address = peer
            .address()
            .parse()
            .map_err(|_| StreamError::InvalidAddress(peer.address().to_string()))?;
        Ok(Self::new(address, channel))
    }
}

#[async_trait::async_trait]
impl StreamConnector for RfcommConnector {
    async fn connect(&self, id: StreamId) -> Result<StreamingChannel, StreamError> {
        debug!(
            "Connecting RFCOMM {} channel {} (service {})",
            self.address, self.channel, SERIAL_PORT_UUID
        );
        let stream = Stream::connect(SocketAddr::new(self.address, self.channel))
            .await
            .map_err(StreamError::Socket)?;
        info!("RFCOMM connected to {}", self.address);
        Ok(StreamingChannel::from_io(id, stream))
    }

    fn name(&self) -> &'static str {
        "RFCOMM"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_peer_rejects_bad_address() {
        let peer = PeerLink::new("not-an-address", "ESP32");
        assert!(matches!(
            RfcommConnector::for_peer(&peer, 1),
            Err(StreamError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_for_peer_parses_address() {
        let peer = PeerLink::new("24:6f:28:01:02:03", "ESP32");
        let connector = RfcommConnector::for_peer(&peer, 1).unwrap();
        assert_eq!(connector.address.to_string(), "24:6F:28:01:02:03");
        assert_eq!(connector.name(), "RFCOMM");
    }
}
