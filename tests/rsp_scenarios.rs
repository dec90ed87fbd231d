//! GDB client scenarios over a loopback TCP socket against the simulated target

use std::time::Duration;

use probe_gdb_server::controller::{
    ControllerConfig, TargetController, TargetControllerHandle, TargetControllerState,
};
use probe_gdb_server::events::{Event, EventBus};
use probe_gdb_server::gdb::packet::{checksum, encode_packet, INTERRUPT_BYTE};
use probe_gdb_server::gdb::{GdbRspServer, GdbServerConfig};
use probe_gdb_server::probe::{SimulatedProbe, SimulatorConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    controller: TargetControllerHandle,
    address: std::net::SocketAddr,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<probe_gdb_server::Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        let events = EventBus::new();
        let mut listener = events.subscribe("harness");
        let simulator = SimulatorConfig {
            instructions_per_poll: 4096,
            ..SimulatorConfig::default()
        };
        let controller =
            TargetController::spawn(ControllerConfig::default(), events.clone(), move || {
                Ok(SimulatedProbe::new(simulator))
            })
            .unwrap();

        let active = listener
            .wait_for(
                |e| {
                    matches!(
                        e,
                        Event::ControllerStateChanged {
                            state: TargetControllerState::Active,
                            ..
                        }
                    )
                },
                Duration::from_secs(2),
            )
            .await;
        assert!(active.is_some());

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = tcp.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = GdbRspServer::new(GdbServerConfig::default(), controller.service(), events);
        let server = tokio::spawn(async move { server.serve(tcp, shutdown_rx).await });

        Self {
            controller,
            address,
            shutdown,
            server,
        }
    }

    async fn connect(&self) -> Client {
        Client {
            stream: TcpStream::connect(self.address).await.unwrap(),
            pending: Vec::new(),
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), self.server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        self.controller.shutdown(Duration::from_secs(2)).await;
    }
}

struct Client {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl Client {
    async fn send(&mut self, payload: &str) {
        self.send_raw(&encode_packet(payload.as_bytes())).await;
    }

    async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
    }

    /// Next byte from the server, `None` once it closed the connection
    async fn next_byte(&mut self) -> Option<u8> {
        if self.pending.is_empty() {
            let mut buffer = [0u8; 1024];
            let read = tokio::time::timeout(READ_TIMEOUT, self.stream.read(&mut buffer))
                .await
                .expect("server did not answer in time")
                .unwrap();
            if read == 0 {
                return None;
            }
            self.pending.extend_from_slice(&buffer[..read]);
        }
        Some(self.pending.remove(0))
    }

    async fn expect_byte(&mut self, expected: u8) {
        assert_eq!(self.next_byte().await, Some(expected));
    }

    async fn expect_ack(&mut self) {
        self.expect_byte(b'+').await;
    }

    /// A complete frame exactly as sent, `$payload#hh`
    async fn read_frame(&mut self) -> Vec<u8> {
        let mut frame = Vec::new();
        assert_eq!(self.next_byte().await, Some(b'$'));
        frame.push(b'$');
        loop {
            let byte = self.next_byte().await.unwrap();
            frame.push(byte);
            if byte == b'#' {
                break;
            }
        }
        frame.push(self.next_byte().await.unwrap());
        frame.push(self.next_byte().await.unwrap());
        frame
    }

    async fn read_packet(&mut self) -> String {
        let frame = self.read_frame().await;
        let body = &frame[1..frame.len() - 3];
        let digits = std::str::from_utf8(&frame[frame.len() - 2..]).unwrap();
        assert_eq!(u8::from_str_radix(digits, 16).unwrap(), checksum(body));
        String::from_utf8(body.to_vec()).unwrap()
    }

    async fn request(&mut self, payload: &str) -> String {
        self.send(payload).await;
        self.expect_ack().await;
        self.read_packet().await
    }

    async fn handshake(&mut self) -> String {
        self.request("qSupported:multiprocess+;swbreak+;hwbreak+;vContSupported+").await
    }
}

#[tokio::test]
async fn test_feature_negotiation_reports_packet_size() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;

    let reply = client.handshake().await;
    assert!(reply.starts_with("PacketSize=1000"), "{}", reply);
    assert!(reply.contains("swbreak+"));
    assert!(reply.contains("hwbreak+"));

    harness.stop().await;
}

#[tokio::test]
async fn test_client_without_breakpoint_support_is_dropped() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;

    client.send("qSupported:multiprocess+").await;
    client.expect_ack().await;
    assert_eq!(client.next_byte().await, None);

    // The server keeps accepting clients
    let mut client = harness.connect().await;
    assert!(client.handshake().await.starts_with("PacketSize="));

    harness.stop().await;
}

#[tokio::test]
async fn test_insert_software_breakpoint() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;

    client.send("Z0,8000,2").await;
    client.expect_ack().await;
    assert_eq!(client.read_frame().await, b"$OK#9a".to_vec());

    // Patched memory still reads back as the original
    assert_eq!(client.request("m8000,2").await, "0000");

    harness.stop().await;
}

#[tokio::test]
async fn test_continue_until_breakpoint_sends_stop_reply() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;

    assert_eq!(client.request("Z0,8000,2").await, "OK");
    client.send("c").await;
    client.expect_ack().await;
    assert_eq!(client.read_frame().await, b"$S05#b8".to_vec());

    // Halted on the breakpoint: pc (r15) is the last register in the file
    let registers = client.request("g").await;
    assert_eq!(registers.len(), 16 * 8);
    assert_eq!(&registers[15 * 8..], "00800000");
    assert_eq!(client.request("?").await, "S05");

    harness.stop().await;
}

#[tokio::test]
async fn test_bad_checksum_is_nacked_without_dispatch() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;

    client.send_raw(b"$m0,4#00").await;
    client.expect_byte(b'-').await;

    // Retransmission is acknowledged and answered; nothing came from the bad frame
    client.send_raw(b"$m0,4#fd").await;
    client.expect_ack().await;
    assert_eq!(client.read_packet().await, "00000000");

    harness.stop().await;
}

#[tokio::test]
async fn test_removing_unknown_breakpoint_is_ok() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;

    client.send("z0,9999,2").await;
    client.expect_ack().await;
    assert_eq!(client.read_frame().await, b"$OK#9a".to_vec());

    harness.stop().await;
}

#[tokio::test]
async fn test_interrupt_halts_running_target() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;

    client.send("c").await;
    client.expect_ack().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.send_raw(&[INTERRUPT_BYTE]).await;
    assert_eq!(client.read_packet().await, "S02");
    assert_eq!(client.request("?").await, "S02");

    harness.stop().await;
}

#[tokio::test]
async fn test_no_ack_mode_and_detach() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;

    assert_eq!(client.request("QStartNoAckMode").await, "OK");
    client.send("qAttached").await;
    assert_eq!(client.read_packet().await, "1");

    client.send("D").await;
    assert_eq!(client.read_packet().await, "OK");
    assert_eq!(client.next_byte().await, None);

    harness.stop().await;
}

#[tokio::test]
async fn test_disconnect_removes_session_breakpoints() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;
    assert_eq!(client.request("Z1,400,2").await, "OK");
    client.send("D").await;
    client.expect_ack().await;
    assert_eq!(client.read_packet().await, "OK");
    assert_eq!(client.next_byte().await, None);

    // Every slot is free again: the simulator has four comparators
    let mut client = harness.connect().await;
    client.handshake().await;
    for address in ["1000", "1100", "1200", "1300"] {
        assert_eq!(client.request(&format!("Z1,{},2", address)).await, "OK");
    }
    assert_eq!(client.request("Z1,1400,2").await, "E1c");

    harness.stop().await;
}

#[tokio::test]
async fn test_memory_read_fills_reply_packet() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;

    // 0x800 bytes is 0x1000 hex digits, exactly the advertised packet size
    let memory = client.request("m0,800").await;
    assert_eq!(memory.len(), 4096);
    assert!(memory.bytes().all(|b| b == b'0'));
    assert_eq!(client.request("m0,801").await, "E16");

    harness.stop().await;
}

/// Continue and wait for the stop reply, then return the program counter bytes
async fn continue_to_stop(client: &mut Client) -> String {
    client.send("c").await;
    client.expect_ack().await;
    assert_eq!(client.read_packet().await, "S05");
    let registers = client.request("g").await;
    registers[15 * 8..].to_string()
}

#[tokio::test]
async fn test_step_off_software_breakpoint() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;

    assert_eq!(client.request("Z0,8000,2").await, "OK");
    assert_eq!(continue_to_stop(&mut client).await, "00800000");

    client.send("s").await;
    client.expect_ack().await;
    assert_eq!(client.read_packet().await, "S05");
    let registers = client.request("g").await;
    assert_eq!(&registers[15 * 8..], "02800000");

    // Still reads as the original instruction, and still armed
    assert_eq!(client.request("m8000,2").await, "0000");
    assert_eq!(client.request("z0,8000,2").await, "OK");

    harness.stop().await;
}

#[tokio::test]
async fn test_continue_from_software_breakpoint_makes_progress() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;

    assert_eq!(client.request("Z0,8000,2").await, "OK");
    assert_eq!(client.request("Z0,8010,2").await, "OK");
    assert_eq!(continue_to_stop(&mut client).await, "00800000");
    assert_eq!(continue_to_stop(&mut client).await, "10800000");

    harness.stop().await;
}

#[tokio::test]
async fn test_breakpoint_right_after_resume_address_is_hit() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;

    assert_eq!(client.request("Z0,8000,2").await, "OK");
    assert_eq!(client.request("Z1,8002,2").await, "OK");
    assert_eq!(continue_to_stop(&mut client).await, "00800000");
    assert_eq!(continue_to_stop(&mut client).await, "02800000");

    harness.stop().await;
}

#[tokio::test]
async fn test_continue_from_hardware_breakpoint_makes_progress() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    client.handshake().await;

    assert_eq!(client.request("Z1,8000,2").await, "OK");
    assert_eq!(client.request("Z1,8004,2").await, "OK");
    assert_eq!(continue_to_stop(&mut client).await, "00800000");
    assert_eq!(continue_to_stop(&mut client).await, "04800000");

    harness.stop().await;
}
