//! These raise real signals at the test process, so they live in a
//! binary of their own and run one after another in a single test.
use k9::assert_equal;
use mailcore_reactor::{AcceptConfig, Listener};
use mailcore_server::echo::EchoDispatch;
use mailcore_server::store::AlwaysReachable;
use mailcore_server::{Outcome, Worker, WorkerState, WorkerTiming};
use signal_hook::consts::signal::{SIGHUP, SIGTERM, SIGUSR1};
use signal_hook::low_level::raise;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

const TIMING: WorkerTiming = WorkerTiming {
    probe_interval: Duration::from_millis(50),
    shutdown_timeout: Duration::from_secs(10),
};

fn make_worker() -> Worker {
    let listener = Listener::bind_tcp("127.0.0.1:0".parse().unwrap(), 16, false).unwrap();
    Worker::new(
        vec![listener],
        AcceptConfig::default(),
        Box::new(EchoDispatch::new("test", None)),
        Box::new(AlwaysReachable),
        TIMING,
    )
    .unwrap()
}

fn listen_addr(worker: &Worker) -> SocketAddr {
    worker.reactor().listeners()[0].local_addr().unwrap()
}

struct Client {
    stream: TcpStream,
    received: Vec<u8>,
    eof: bool,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        Self {
            stream,
            received: vec![],
            eof: false,
        }
    }

    fn poll(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => self.received.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                    self.eof = true;
                    break;
                }
                Err(err) => panic!("client read: {err:#}"),
            }
        }
    }

    fn saw(&mut self, text: &str) -> bool {
        self.poll();
        String::from_utf8_lossy(&self.received).contains(text)
    }
}

/// Turn the worker until `done` holds or the worker stops
fn pump_until(worker: &mut Worker, mut done: impl FnMut(&Worker) -> bool) -> Option<Outcome> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done(worker) {
        assert!(Instant::now() < deadline, "worker made no progress");
        if let Some(outcome) = worker.turn().unwrap() {
            return Some(outcome);
        }
    }
    None
}

#[test]
fn signals_drive_the_worker() {
    // graceful stop drains the open connection and accepts no more
    let mut worker = make_worker();
    assert_equal!(worker.state(), WorkerState::Serving);
    let addr = listen_addr(&worker);

    let mut client = Client::connect(addr);
    pump_until(&mut worker, |_| client.saw("OK test ready\r\n"));

    raise(SIGUSR1).unwrap();
    assert_equal!(worker.turn().unwrap(), None);
    assert_equal!(worker.state(), WorkerState::Serving);

    raise(SIGTERM).unwrap();
    assert_equal!(
        pump_until(&mut worker, |w| w.state() == WorkerState::Draining),
        None
    );
    assert!(!worker.reactor().is_accepting());

    // the kernel may complete this handshake, but the worker never
    // picks it up
    let _late = TcpStream::connect(addr);

    client.stream.write_all(b"ping\r\n").unwrap();
    pump_until(&mut worker, |_| client.saw("ping\r\n"));
    assert_equal!(worker.reactor().connection_count(), 1);
    assert_equal!(worker.state(), WorkerState::Draining);

    client.stream.write_all(b"QUIT\r\n").unwrap();
    assert_equal!(pump_until(&mut worker, |_| false), Some(Outcome::Exit));
    assert!(client.saw("OK bye\r\n"));
    assert_equal!(worker.state(), WorkerState::Stopped);
    drop(worker);

    // a second stop while draining closes whatever is left
    let mut worker = make_worker();
    let mut client = Client::connect(listen_addr(&worker));
    pump_until(&mut worker, |_| client.saw("OK test ready\r\n"));
    raise(SIGTERM).unwrap();
    pump_until(&mut worker, |w| w.state() == WorkerState::Draining);
    raise(SIGTERM).unwrap();
    assert_equal!(pump_until(&mut worker, |_| false), Some(Outcome::Exit));
    assert_equal!(worker.reactor().connection_count(), 0);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !client.eof {
        assert!(Instant::now() < deadline, "connection was left open");
        client.poll();
        std::thread::sleep(Duration::from_millis(10));
    }
    drop(worker);

    // SIGHUP asks for a restart once the drain completes
    let mut worker = make_worker();
    raise(SIGHUP).unwrap();
    assert_equal!(pump_until(&mut worker, |_| false), Some(Outcome::Restart));
}
