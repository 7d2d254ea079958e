//! RTU and ASCII client/server exchanges over in-memory duplex streams
//! standing in for a pseudo-terminal pair.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use simbus::{
    AsciiClient, AsciiServer, AsciiServerConfig, DataStore, DataStoreConfig, RtuClient, RtuServer,
    RtuServerConfig, SerialConfig,
};

fn datastore(config: Option<&str>) -> Arc<DataStore> {
    let config: Option<DataStoreConfig> =
        config.map(|doc| serde_json::from_str(doc).expect("test config parses"));
    Arc::new(DataStore::new(config))
}

fn serial_config() -> SerialConfig {
    SerialConfig {
        timeout: Duration::from_secs(2),
        ..SerialConfig::default()
    }
}

#[tokio::test]
async fn test_rtu_write_single_coil_roundtrip() {
    let (server_end, client_end) = tokio::io::duplex(1024);
    let ds = datastore(None);
    let mut server = RtuServer::new(server_end, ds.clone(), RtuServerConfig::default());
    server.start().unwrap();

    let client = RtuClient::with_port(client_end, 1, serial_config());
    let cancel = CancellationToken::new();

    let echoed = client
        .write_single_coil(&cancel, 100, 0xFF00)
        .await
        .unwrap();
    assert_eq!(echoed, vec![0xFF, 0x00]);
    assert_eq!(ds.read_coils(100, 1).unwrap(), vec![true]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_rtu_read_registers_roundtrip() {
    let (server_end, client_end) = tokio::io::duplex(1024);
    let ds = datastore(Some(r#"{"HoldingRegs": {"0": 4660, "1": 22136}}"#));
    let mut server = RtuServer::new(server_end, ds, RtuServerConfig::default());
    server.start().unwrap();

    let client = RtuClient::with_port(client_end, 1, serial_config());
    let cancel = CancellationToken::new();

    let bytes = client.read_holding_registers(&cancel, 0, 2).await.unwrap();
    assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);

    // Writes land in the same banks the reads see.
    client
        .write_multiple_registers(&cancel, 10, 2, &[0xAA, 0xBB, 0xCC, 0xDD])
        .await
        .unwrap();
    let bytes = client.read_holding_registers(&cancel, 10, 2).await.unwrap();
    assert_eq!(bytes, vec![0xAA, 0xBB, 0xCC, 0xDD]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_rtu_exception_surfaces_typed() {
    let (server_end, client_end) = tokio::io::duplex(1024);
    let mut server = RtuServer::new(server_end, datastore(None), RtuServerConfig::default());
    server.start().unwrap();

    let client = RtuClient::with_port(client_end, 1, serial_config());
    let cancel = CancellationToken::new();

    let err = client
        .read_holding_registers(&cancel, 65_535, 2)
        .await
        .unwrap_err();
    assert_eq!(err.as_exception(), Some((0x83, 0x02)));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_rtu_timeout_injection_suppressed_on_serial() {
    // The same policy that drops TCP responses must answer on RTU.
    let doc = r#"{
        "HoldingRegs": {"200": 77},
        "delays": {"holdingRegs": {"200": {"timeoutProbability": 1.0}}}
    }"#;
    let (server_end, client_end) = tokio::io::duplex(1024);
    let mut server = RtuServer::new(server_end, datastore(Some(doc)), RtuServerConfig::default());
    server.start().unwrap();

    let client = RtuClient::with_port(client_end, 1, serial_config());
    let cancel = CancellationToken::new();

    let bytes = client.read_holding_registers(&cancel, 200, 1).await.unwrap();
    assert_eq!(bytes, vec![0x00, 0x4D]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_rtu_broadcast_answered_as_if_addressed() {
    let (server_end, mut raw_client) = tokio::io::duplex(1024);
    let ds = datastore(None);
    let mut server = RtuServer::new(server_end, ds.clone(), RtuServerConfig::default());
    server.start().unwrap();

    // WriteSingleCoil(100, ON) addressed to slave 0 (broadcast):
    // 01 05 00 64 FF 00 with slave byte 0 and its CRC.
    let pdu = simbus::PduBuilder::build_write_single(0x05, 100, 0xFF00).unwrap();
    let request = simbus::Framer::encode(&simbus::RtuFramer::new(0), &pdu).unwrap();
    raw_client.write_all(&request).await.unwrap();

    // The simulator answers broadcasts with its own slave id.
    let mut response = [0u8; 8];
    timeout(Duration::from_secs(2), raw_client.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response[0], 1);
    assert_eq!(&response[1..6], &[0x05, 0x00, 0x64, 0xFF, 0x00]);
    assert_eq!(ds.read_coils(100, 1).unwrap(), vec![true]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_rtu_client_cancellation_on_stalled_device() {
    let (mut device_end, client_end) = tokio::io::duplex(1024);

    // A device that answers the first 4 bytes of the response, then stalls.
    tokio::spawn(async move {
        let mut request = vec![0u8; 8];
        device_end.read_exact(&mut request).await.unwrap();
        device_end
            .write_all(&[0x01, 0x03, 0x02, 0x00])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let config = SerialConfig {
        timeout: Duration::from_secs(30),
        ..SerialConfig::default()
    };
    let client = RtuClient::with_port(client_end, 1, config);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let err = client
        .read_holding_registers(&cancel, 0, 1)
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "expected cancellation, got: {err}");
}

#[tokio::test]
async fn test_ascii_read_coils_roundtrip() {
    let (server_end, client_end) = tokio::io::duplex(1024);
    let ds = datastore(Some(r#"{"Coils": {"0": true, "2": true}}"#));
    let mut server = AsciiServer::new(server_end, ds, AsciiServerConfig::default());
    server.start().unwrap();

    let client = AsciiClient::with_port(client_end, 1, serial_config());
    let cancel = CancellationToken::new();

    // coil[0]=1, coil[1]=0, coil[2]=1 -> one packed byte 0b101
    let bytes = client.read_coils(&cancel, 0, 3).await.unwrap();
    assert_eq!(bytes, vec![0x05]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_ascii_write_register_roundtrip() {
    let (server_end, client_end) = tokio::io::duplex(1024);
    let ds = datastore(None);
    let mut server = AsciiServer::new(server_end, ds.clone(), AsciiServerConfig::default());
    server.start().unwrap();

    let client = AsciiClient::with_port(client_end, 1, serial_config());
    let cancel = CancellationToken::new();

    client
        .write_single_register(&cancel, 5, 0x0102)
        .await
        .unwrap();
    assert_eq!(ds.read_holding_registers(5, 1).unwrap(), vec![0x0102]);

    let bytes = client.read_holding_registers(&cancel, 5, 1).await.unwrap();
    assert_eq!(bytes, vec![0x01, 0x02]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_ascii_server_skips_line_noise() {
    let (server_end, mut raw_client) = tokio::io::duplex(1024);
    let ds = datastore(Some(r#"{"HoldingRegs": {"0": 258}}"#));
    let mut server = AsciiServer::new(server_end, ds, AsciiServerConfig::default());
    server.start().unwrap();

    // Garbage before the start marker must be ignored.
    raw_client.write_all(b"xx\r\n").await.unwrap();
    // ReadHoldingRegisters(0, 1): LRC of 01 03 00 00 00 01 = FB
    raw_client.write_all(b":010300000001FB\r\n").await.unwrap();

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        timeout(Duration::from_secs(2), raw_client.read_exact(&mut byte))
            .await
            .unwrap()
            .unwrap();
        response.push(byte[0]);
        if response.ends_with(b"\r\n") {
            break;
        }
    }
    // Response: slave 01, fc 03, byte count 02, value 0x0102, LRC F7
    assert_eq!(response, b":0103020102F7\r\n");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_serial_servers_ignore_other_slave_ids() {
    let (server_end, client_end) = tokio::io::duplex(1024);
    let mut server = AsciiServer::new(
        server_end,
        datastore(None),
        AsciiServerConfig { slave_id: 2 },
    );
    server.start().unwrap();

    let config = SerialConfig {
        timeout: Duration::from_millis(300),
        ..SerialConfig::default()
    };
    let client = AsciiClient::with_port(client_end, 1, config);
    let cancel = CancellationToken::new();

    // Server is slave 2; a request for slave 1 gets no answer and the read
    // times out.
    let err = client.read_coils(&cancel, 0, 1).await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got: {err}");

    server.stop().await.unwrap();
}
