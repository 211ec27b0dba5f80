//! These fork real workers and signal the test process, so they live
//! in a binary of their own and run one after another in a single test.
use k9::assert_equal;
use mailcore_reactor::{Listener, SignalBridge};
use mailcore_server::supervisor::Supervisor;
use mailcore_server::Outcome;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::thread::{sleep, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy)]
enum Behaviour {
    /// Stop when asked
    Graceful,
    /// The first worker in slot 0 exits at once, every later one is
    /// graceful
    FirstExits,
    /// Never stop on request
    Stubborn,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis()
}

/// Start times of the workers spawned into `slot`, oldest first
fn spawns(dir: &Path, slot: usize) -> Vec<u128> {
    let prefix = format!("spawn-{slot}-");
    let mut times: Vec<u128> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| {
            let entry = entry.unwrap();
            let name = entry.file_name().into_string().unwrap();
            if !name.starts_with(&prefix) {
                return None;
            }
            std::fs::read_to_string(entry.path()).ok()?.parse().ok()
        })
        .collect();
    times.sort();
    times
}

fn marker_pids(dir: &Path, prefix: &str) -> Vec<Pid> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| {
            let name = entry.unwrap().file_name().into_string().unwrap();
            let pid = name.strip_prefix(prefix)?.rsplit('-').next()?.parse().ok()?;
            Some(Pid::from_raw(pid))
        })
        .collect()
}

fn worker(dir: &Path, behaviour: Behaviour, slot: usize, bridge: SignalBridge) -> Outcome {
    let pid = std::process::id();
    let spawn = dir.join(format!("spawn-{slot}-{pid}"));
    std::fs::write(&spawn, now_millis().to_string()).unwrap();

    let graceful = match behaviour {
        Behaviour::Graceful => true,
        Behaviour::FirstExits => slot != 0 || spawns(dir, 0).len() > 1,
        Behaviour::Stubborn => false,
    };
    if matches!(behaviour, Behaviour::FirstExits) && !graceful {
        return Outcome::Exit;
    }

    loop {
        if graceful && bridge.take().stop {
            std::fs::write(dir.join(format!("stopped-{pid}")), "").unwrap();
            return Outcome::Exit;
        }
        sleep(Duration::from_millis(10));
    }
}

/// Once `started` workers have recorded themselves, send each of
/// `signals` to this process in turn
fn signal_after(dir: PathBuf, started: usize, signals: Vec<Signal>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while marker_pids(&dir, "spawn-").len() < started && Instant::now() < deadline {
            sleep(Duration::from_millis(10));
        }
        for signal in signals {
            kill(Pid::this(), signal).unwrap();
            sleep(Duration::from_millis(200));
        }
    })
}

struct Run {
    outcome: Outcome,
    elapsed: Duration,
    dir: tempfile::TempDir,
}

fn supervise(
    workers: usize,
    shutdown_timeout: Duration,
    behaviour: Behaviour,
    started: usize,
    signals: Vec<Signal>,
) -> Run {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    let child_main =
        |slot: usize, _listeners: Vec<Listener>, bridge: SignalBridge| -> anyhow::Result<Outcome> {
            Ok(worker(&path, behaviour, slot, bridge))
        };
    let supervisor = Supervisor::new(workers, shutdown_timeout, vec![], &child_main).unwrap();

    let helper = signal_after(path.clone(), started, signals);
    let start = Instant::now();
    let outcome = supervisor.run().unwrap();
    let elapsed = start.elapsed();
    helper.join().unwrap();
    Run {
        outcome,
        elapsed,
        dir,
    }
}

fn assert_all_gone(dir: &Path) {
    for pid in marker_pids(dir, "spawn-") {
        assert!(kill(pid, None::<Signal>).is_err(), "worker {pid} is still running");
    }
}

#[test]
fn supervisor_lifecycle() {
    // a worker that exits is replaced, but not before it would have
    // lived for a second
    let run = supervise(
        2,
        Duration::from_secs(10),
        Behaviour::FirstExits,
        3,
        vec![Signal::SIGTERM],
    );
    assert_equal!(run.outcome, Outcome::Exit);
    let slot0 = spawns(run.dir.path(), 0);
    assert_equal!(slot0.len(), 2);
    assert!(
        slot0[1] - slot0[0] >= 900,
        "respawned after {}ms",
        slot0[1] - slot0[0]
    );
    assert_equal!(spawns(run.dir.path(), 1).len(), 1);
    // SIGTERM was passed on to both live workers
    assert_equal!(marker_pids(run.dir.path(), "stopped-").len(), 2);
    assert_all_gone(run.dir.path());

    // SIGHUP stops the workers too, then asks for a new generation
    let run = supervise(
        2,
        Duration::from_secs(10),
        Behaviour::Graceful,
        2,
        vec![Signal::SIGHUP],
    );
    assert_equal!(run.outcome, Outcome::Restart);
    assert_equal!(marker_pids(run.dir.path(), "stopped-").len(), 2);
    assert_all_gone(run.dir.path());

    // a stop that arrives while the workers are still starting up is
    // not lost
    let run = supervise(
        2,
        Duration::from_secs(60),
        Behaviour::Graceful,
        0,
        vec![Signal::SIGTERM],
    );
    assert_equal!(run.outcome, Outcome::Exit);
    assert!(run.elapsed < Duration::from_secs(30), "took {:?}", run.elapsed);
    assert_equal!(marker_pids(run.dir.path(), "spawn-").len(), 2);
    assert_equal!(marker_pids(run.dir.path(), "stopped-").len(), 2);
    assert_all_gone(run.dir.path());

    // workers that ignore SIGTERM are killed once shutdown_timeout
    // has elapsed
    let run = supervise(
        1,
        Duration::from_millis(300),
        Behaviour::Stubborn,
        1,
        vec![Signal::SIGTERM],
    );
    assert_equal!(run.outcome, Outcome::Exit);
    assert!(run.elapsed >= Duration::from_millis(300));
    assert!(run.elapsed < Duration::from_secs(10), "took {:?}", run.elapsed);
    assert_equal!(marker_pids(run.dir.path(), "stopped-").len(), 0);
    assert_all_gone(run.dir.path());

    // or straight away on a second stop request
    let run = supervise(
        1,
        Duration::from_secs(60),
        Behaviour::Stubborn,
        1,
        vec![Signal::SIGTERM, Signal::SIGTERM],
    );
    assert_equal!(run.outcome, Outcome::Exit);
    assert!(run.elapsed < Duration::from_secs(30), "took {:?}", run.elapsed);
    assert_equal!(marker_pids(run.dir.path(), "stopped-").len(), 0);
    assert_all_gone(run.dir.path());
}
