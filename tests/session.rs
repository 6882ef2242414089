//! End-to-end sessions: the polling client talking to the sample server
//! through the pseudo-terminal proxy, all in one process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use me162_pub::iec62056::client::ModeCClient;
use me162_pub::iec62056::server::{Action, Me162DataProvider, ModeCServer, ServerRunner};
use me162_pub::processor::ValueProcessor;
use me162_pub::serial::SerialProxy;
use me162_pub::Result;

#[derive(Default)]
struct Recording {
    readouts: Vec<String>,
    registers: Vec<(String, String, Option<String>)>,
    publishes: usize,
}

/// Captures everything the client decodes and stops after the first
/// publish round.
struct RecordingProcessor {
    shared: Arc<Mutex<Recording>>,
}

impl ValueProcessor for RecordingProcessor {
    fn set_readout(&mut self, text: &str) {
        self.shared.lock().unwrap().readouts.push(text.to_string());
    }

    fn set_register(&mut self, address: &str, value: &str, unit: Option<&str>) -> Result<()> {
        self.shared.lock().unwrap().registers.push((
            address.to_string(),
            value.to_string(),
            unit.map(str::to_string),
        ));
        Ok(())
    }

    fn try_publish(&mut self) {
        self.shared.lock().unwrap().publishes += 1;
    }

    fn should_stop(&self) -> bool {
        self.shared.lock().unwrap().publishes >= 1
    }
}

struct Harness {
    link: std::path::PathBuf,
    adev: String,
    stop: Arc<AtomicBool>,
    proxy_thread: std::thread::JoinHandle<Result<()>>,
    _dir: tempfile::TempDir,
}

fn start_proxy() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let link = dir.path().join("meter.sock");

    let mut proxy = SerialProxy::exposed(&link).unwrap();
    let adev = proxy.a_dev().to_string_lossy().into_owned();

    let stop = Arc::new(AtomicBool::new(false));
    let proxy_stop = Arc::clone(&stop);
    let proxy_thread = std::thread::spawn(move || proxy.run(&proxy_stop));

    Harness {
        link,
        adev,
        stop,
        proxy_thread,
        _dir: dir,
    }
}

#[tokio::test]
async fn full_session_readout_and_programming() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = start_proxy();

    let adev = harness.adev.clone();
    let server_stop = Arc::clone(&harness.stop);
    let server_thread = std::thread::spawn(move || -> Result<()> {
        let mut machine = ModeCServer::new(Me162DataProvider::sample());
        let mut runner = ServerRunner::open(&adev)?;
        runner.run(&mut machine, &server_stop, || Ok(()))
    });

    let shared = Arc::new(Mutex::new(Recording::default()));
    let processor = RecordingProcessor {
        shared: Arc::clone(&shared),
    };

    let link = harness.link.to_string_lossy().into_owned();
    let mut client = ModeCClient::open(&link, processor).await.unwrap();
    tokio::time::timeout(Duration::from_secs(60), client.run())
        .await
        .expect("session timed out")
        .unwrap();

    harness.stop.store(true, Ordering::Relaxed);
    drop(client);
    harness.proxy_thread.join().unwrap().unwrap();
    // The proxy may tear the line down before the server notices the
    // stop flag; a hangup is a normal way out here.
    match server_thread.join().unwrap() {
        Ok(()) | Err(me162_pub::Error::Hangup) => {}
        Err(e) => panic!("server failed: {}", e),
    }

    let recording = shared.lock().unwrap();

    // One full readout, parsed into its nine datasets.
    assert_eq!(recording.readouts.len(), 1);
    let readout_registers = &recording.registers[..9];
    let addresses: Vec<&str> = readout_registers.iter().map(|(a, _, _)| a.as_str()).collect();
    assert_eq!(
        addresses,
        ["C.1.0", "0.0.0", "1.8.0", "1.8.1", "1.8.2", "2.8.0", "2.8.1", "2.8.2", "F.F"]
    );

    // Then the programming-mode poll round for the two totals.
    assert_eq!(
        recording.registers[9],
        (
            "1.8.0".to_string(),
            "0034204.753".to_string(),
            Some("kWh".to_string())
        )
    );
    assert_eq!(
        recording.registers[10],
        (
            "2.8.0".to_string(),
            "0001516.488".to_string(),
            Some("kWh".to_string())
        )
    );
    assert_eq!(recording.registers.len(), 11);
    assert_eq!(recording.publishes, 1);
}

#[tokio::test]
async fn corrupted_frame_is_naked_and_repeated() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = start_proxy();

    // A hand-rolled runner that flips the checksum of the first long STX
    // frame it transmits. The client must answer NAK, upon which the
    // state machine repeats the frame intact.
    let adev = harness.adev.clone();
    let server_stop = Arc::clone(&harness.stop);
    let server_thread = std::thread::spawn(move || -> Result<()> {
        let mut machine = ModeCServer::new(Me162DataProvider::sample());
        let mut port = serialport::new(adev.as_str(), 300)
            .timeout(Duration::from_millis(200))
            .open()?;
        let mut baud: u32 = 300;
        let mut corrupted_once = false;

        let mut byte = [0u8; 1];
        let mut actions = Vec::new();
        while !server_stop.load(Ordering::Relaxed) {
            match port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => machine.feed_byte(byte[0], &mut actions),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.raw_os_error() == Some(5) => break,
                Err(e) => return Err(e.into()),
            }
            for action in actions.drain(..) {
                match action {
                    Action::SetBaud(b) => {
                        port.set_baud_rate(b)?;
                        baud = b;
                    }
                    Action::Send(mut frame) => {
                        // Corrupt the first long STX frame, which is the
                        // data readout.
                        if !corrupted_once && frame[0] == 0x02 && frame.len() > 10 {
                            *frame.last_mut().unwrap() ^= 0x01;
                            corrupted_once = true;
                        }
                        port.write_all(&frame)?;
                        port.flush()?;
                        std::thread::sleep(Duration::from_secs_f64(
                            frame.len() as f64 * 10.0 / baud as f64,
                        ));
                    }
                }
            }
        }
        Ok(())
    });

    let shared = Arc::new(Mutex::new(Recording::default()));
    let processor = RecordingProcessor {
        shared: Arc::clone(&shared),
    };

    let link = harness.link.to_string_lossy().into_owned();
    let mut client = ModeCClient::open(&link, processor).await.unwrap();
    // The corruption lands on the readout frame, the first long STX
    // frame of the session. Polling a single register keeps the rest of
    // the session short.
    let mut session = me162_pub::iec62056::client::Session::new(vec!["1.8.0".to_string()]);
    tokio::time::timeout(Duration::from_secs(60), client.run_session(&mut session))
        .await
        .expect("session timed out")
        .unwrap();

    harness.stop.store(true, Ordering::Relaxed);
    drop(client);
    harness.proxy_thread.join().unwrap().unwrap();
    server_thread.join().unwrap().unwrap();

    let recording = shared.lock().unwrap();
    // The register made it through exactly once, after the NAK retry.
    assert_eq!(
        recording.registers.last(),
        Some(&(
            "1.8.0".to_string(),
            "0034204.753".to_string(),
            Some("kWh".to_string())
        ))
    );
    assert_eq!(recording.publishes, 1);
}
