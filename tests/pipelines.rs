//! End-to-end tests driving real Unix commands.

use pipework::{DataReader, DataWriter, Error, File, Pipeline, Signal, Stdio};

#[test]
fn single_stage_success() {
    let mut pipeline = Pipeline::builder().cmd(["true"]).build().unwrap();
    pipeline.wait().unwrap();
    assert!(!pipeline.failed());
    assert_eq!(pipeline.processes()[0].returncode(), Some(0));
}

#[test]
fn nonzero_exit_reported() {
    let mut pipeline = Pipeline::builder().cmd(["false"]).build().unwrap();
    let err = pipeline.wait().unwrap_err();
    assert_eq!(err.to_string(), "process exited 1: false");
    assert!(pipeline.failed());
    assert_eq!(pipeline.processes()[0].returncode(), Some(1));
}

#[test]
fn first_failure_wins_but_all_are_recorded() {
    let mut pipeline = Pipeline::builder()
        .cmd(["sh", "-c", "exit 3"])
        .cmd(["sh", "-c", "exit 4"])
        .cmd(["sh", "-c", "exit 5"])
        .build()
        .unwrap();
    let err = pipeline.wait().unwrap_err();
    assert!(err.to_string().contains("process exited 3"), "{err}");
    assert_eq!(pipeline.processes()[0].returncode(), Some(3));
    assert_eq!(pipeline.processes()[1].returncode(), Some(4));
    assert_eq!(pipeline.processes()[2].returncode(), Some(5));
    assert!(pipeline.processes()[1].failure().is_some());
    assert!(pipeline.processes()[2].failure().is_some());
}

#[test]
fn memory_to_memory_round_trip() {
    let out = DataReader::new();
    Pipeline::builder()
        .cmd(["sort", "-r"])
        .stdin(DataWriter::new("one\ntwo\nthree\n").unwrap())
        .stdout(&out)
        .build()
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(out.data(), "two\nthree\none\n");
}

#[test]
fn shared_stderr_reader_collects_every_stage() {
    let errs = DataReader::new();
    Pipeline::builder()
        .cmd(["sh", "-c", "echo err1 >&2"])
        .cmd(["sh", "-c", "echo err2 >&2; cat >/dev/null"])
        .stderr(&errs)
        .build()
        .unwrap()
        .wait()
        .unwrap();
    let text = errs.data();
    assert!(text.contains("err1\n"), "{text:?}");
    assert!(text.contains("err2\n"), "{text:?}");
    assert_eq!(text.len(), "err1\nerr2\n".len());
}

#[test]
fn signaled_process_reported_by_name() {
    let mut pipeline = Pipeline::builder()
        .cmd(["sh", "-c", "kill -SEGV $$"])
        .build()
        .unwrap();
    let err = pipeline.wait().unwrap_err();
    assert!(
        err.to_string().starts_with("process signaled: SIGSEGV: "),
        "{err}"
    );
    match err {
        Error::Process(perr) => assert_eq!(perr.signal(), Some(Signal::SIGSEGV)),
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn sigpipe_death_is_success() {
    let out = DataReader::new();
    Pipeline::builder()
        .cmd(["yes"])
        .cmd(["head", "-n", "1"])
        .stdout(&out)
        .build()
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(out.data(), "y\n");
}

#[test]
fn missing_program_raises_spawn_failure() {
    let mut pipeline = Pipeline::builder()
        .cmd(["no-such-program-zzz"])
        .build()
        .unwrap();
    let err = pipeline.wait().unwrap_err();
    assert!(
        err.to_string().starts_with("exec failed: no-such-program-zzz"),
        "{err}"
    );
    match err {
        Error::Process(perr) => {
            assert!(perr.returncode().is_none());
            assert!(std::error::Error::source(&perr).is_some());
        }
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn failing_stage_carries_captured_stderr() {
    let mut pipeline = Pipeline::builder()
        .cmd(["sh", "-c", "echo boom >&2; exit 7"])
        .build()
        .unwrap();
    let err = pipeline.wait().unwrap_err();
    let text = err.to_string();
    assert!(text.starts_with("process exited 7: "), "{text}");
    assert!(text.ends_with(":\nboom\n"), "{text}");
}

#[test]
fn kill_terminates_the_group() {
    let mut pipeline = Pipeline::builder()
        .cmd(["sleep", "60"])
        .cmd(["sleep", "60"])
        .build()
        .unwrap();
    pipeline.start().unwrap();
    pipeline.kill(Signal::SIGTERM).unwrap();
    let err = pipeline.wait().unwrap_err();
    assert!(
        err.to_string().starts_with("process signaled: SIGTERM: "),
        "{err}"
    );
}

#[test]
fn wait_kill_shutdown_are_idempotent() {
    let mut pipeline = Pipeline::builder().cmd(["true"]).build().unwrap();
    pipeline.wait().unwrap();
    pipeline.kill(Signal::SIGKILL).unwrap();
    pipeline.wait().unwrap();
    pipeline.shutdown();
    pipeline.shutdown();
}

#[test]
fn failed_wait_repeats_its_outcome() {
    let mut pipeline = Pipeline::builder().cmd(["false"]).build().unwrap();
    assert!(pipeline.wait().is_err());
    let err = pipeline.wait().unwrap_err();
    assert_eq!(err.to_string(), "process exited 1: false");
}

#[test]
fn shutdown_reaps_a_running_pipeline() {
    let mut pipeline = Pipeline::builder().cmd(["sleep", "60"]).build().unwrap();
    pipeline.start().unwrap();
    pipeline.shutdown();
    // the forced kill is cleanup, not a failure
    assert!(!pipeline.failed());
    assert_eq!(pipeline.processes()[0].returncode(), Some(-(Signal::SIGKILL as i32)));
}

#[test]
fn poll_tracks_completion() {
    let mut pipeline = Pipeline::builder().cmd(["sleep", "0.1"]).build().unwrap();
    // the first poll starts the pipeline
    while !pipeline.poll().unwrap() {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(pipeline.processes()[0].returncode(), Some(0));
}

#[test]
fn poll_stays_nonblocking_with_shared_stderr_reader() {
    let errs = DataReader::new();
    let mut pipeline = Pipeline::builder()
        .cmd(["true"])
        .cmd(["sleep", "1"])
        .stderr(&errs)
        .build()
        .unwrap();
    pipeline.start().unwrap();
    // give the first stage time to exit while the second keeps running
    std::thread::sleep(std::time::Duration::from_millis(300));
    let clock = std::time::Instant::now();
    let done = pipeline.poll().unwrap();
    let elapsed = clock.elapsed();
    assert!(
        elapsed < std::time::Duration::from_millis(250),
        "poll blocked for {elapsed:?}"
    );
    assert!(!done);
    pipeline.wait().unwrap();
}

#[test]
fn start_twice_is_an_error() {
    let mut pipeline = Pipeline::builder().cmd(["true"]).build().unwrap();
    pipeline.start().unwrap();
    let err = pipeline.start().unwrap_err();
    assert!(err.to_string().contains("already started"));
    pipeline.wait().unwrap();
}

#[test]
fn file_devices_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in.txt");
    let dst = dir.path().join("out.txt");
    std::fs::write(&src, "beta\nalpha\n").unwrap();
    Pipeline::builder()
        .cmd(["sort"])
        .stdin(File::open(&src, "r").unwrap())
        .stdout(File::open(&dst, "w").unwrap())
        .build()
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "alpha\nbeta\n");
}

#[test]
fn file_append_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.txt");
    std::fs::write(&path, "old\n").unwrap();
    Pipeline::builder()
        .cmd(["echo", "new"])
        .stdout(File::open(&path, "a").unwrap())
        .build()
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nnew\n");
}

#[test]
fn path_stdio_opens_by_role() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in.txt");
    let dst = dir.path().join("out.txt");
    std::fs::write(&src, "hello\n").unwrap();
    Pipeline::builder()
        .cmd(["cat"])
        .stdin(src.as_path())
        .stdout(dst.as_path())
        .build()
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "hello\n");
}

#[test]
fn invalid_file_mode_rejected() {
    let err = File::open("/dev/null", "x").unwrap_err();
    assert!(err.to_string().contains("invalid mode: 'x'"));
}

#[test]
fn data_writer_rejects_second_pipeline() {
    let writer = DataWriter::new("payload").unwrap();
    let _first = Pipeline::builder()
        .cmd(["cat"])
        .stdin(&writer)
        .build()
        .unwrap();
    let err = Pipeline::builder()
        .cmd(["cat"])
        .stdin(&writer)
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("already bound to a process"));
}

#[test]
fn binary_data_survives_capture() {
    let payload: Vec<u8> = (0u8..=255).collect();
    let out = DataReader::new();
    Pipeline::builder()
        .cmd(["cat"])
        .stdin(DataWriter::new(payload.clone()).unwrap())
        .stdout(&out)
        .build()
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(out.bytes(), payload);
}

#[test]
fn run_helpers() {
    pipework::run([["true"]]).unwrap();
    assert_eq!(pipework::run_out([["echo", "hi"]]).unwrap(), "hi\n");
    assert_eq!(
        pipework::run_lex_out(&["printf 'a b\\n'", "cat"]).unwrap(),
        "a b\n"
    );
    let err = pipework::run([["false"]]).unwrap_err();
    assert_eq!(err.to_string(), "process exited 1: false");
}

#[test]
fn no_descriptors_or_threads_leak() {
    let fds = || std::fs::read_dir("/proc/self/fd").unwrap().count();
    let threads = || std::fs::read_dir("/proc/self/task").unwrap().count();
    // warm up lazy allocations before taking the baseline; other tests
    // run concurrently in this process, so allow some slack
    pipework::run_out([["echo", "warmup"]]).unwrap();
    let (fds_before, threads_before) = (fds(), threads());
    for _ in 0..10 {
        pipework::run_out([["echo", "hi"]]).unwrap();
    }
    let (fds_after, threads_after) = (fds(), threads());
    assert!(
        fds_after <= fds_before + 16,
        "descriptor count grew from {fds_before} to {fds_after}"
    );
    assert!(
        threads_after <= threads_before + 4,
        "thread count grew from {threads_before} to {threads_after}"
    );
}

#[test]
fn inherit_stderr_skips_capture() {
    let mut pipeline = Pipeline::builder()
        .cmd(["sh", "-c", "exit 9"])
        .stderr(Stdio::Inherit)
        .build()
        .unwrap();
    let err = pipeline.wait().unwrap_err();
    assert_eq!(err.to_string(), "process exited 9: sh -c 'exit 9'");
}
