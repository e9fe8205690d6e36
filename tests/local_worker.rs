//! Behavioural tests for commands and files on a local worker.
#![cfg(unix)]

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use foreman::{Environment, LocalWorker, OpenMode, Worker, WorkerError};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

struct Sandbox {
    _tmp: TempDir,
    root: Utf8PathBuf,
    worker: LocalWorker,
}

#[fixture]
fn sandbox() -> Sandbox {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 tempdir");
    let worker = LocalWorker::new().expect("local worker");
    worker.change_directory(root.as_str()).expect("chdir");
    Sandbox {
        _tmp: tmp,
        root,
        worker,
    }
}

#[rstest]
fn commands_run_concurrently(sandbox: Sandbox) {
    let started = Instant::now();
    let commands: Vec<_> = (0..3)
        .map(|_| sandbox.worker.execute("sleep 1").expect("execute"))
        .collect();

    for command in &commands {
        assert_eq!(command.wait(Some(Duration::from_millis(1500))), Some(0));
    }

    assert!(
        started.elapsed() < Duration::from_secs(2),
        "took {:?}",
        started.elapsed()
    );
}

#[rstest]
fn background_children_do_not_delay_the_exit_status(sandbox: Sandbox) {
    let started = Instant::now();
    let command = sandbox
        .worker
        .execute("sleep 3 & printf hi")
        .expect("execute");

    assert_eq!(command.wait(Some(Duration::from_secs(1))), Some(0));
    assert_eq!(command.stdout(), b"hi");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[rstest]
fn cancelled_command_has_no_status_or_output(sandbox: Sandbox) {
    let command = sandbox.worker.execute("sleep 1").expect("execute");
    thread::sleep(Duration::from_millis(100));

    command.cancel().expect("cancel");

    assert!(command.cancelled());
    assert_eq!(command.exit_status(), None);
    assert!(command.stdout().is_empty());
    assert!(command.stderr().is_empty());
    assert!(matches!(
        command.cancel(),
        Err(WorkerError::AlreadyCancelled { .. })
    ));
}

#[rstest]
fn output_and_status_match_the_process(sandbox: Sandbox) {
    let command = sandbox
        .worker
        .execute("printf 'out\\n'; printf 'err' >&2; exit 3")
        .expect("execute");

    assert_eq!(command.wait(WAIT), Some(3));
    assert_eq!(command.stdout(), b"out\n");
    assert_eq!(command.stderr(), b"err");
}

#[rstest]
fn callback_runs_exactly_once(sandbox: Sandbox) {
    let calls = Arc::new(AtomicUsize::new(0));
    let command = sandbox.worker.execute("true").expect("execute");
    let seen = Arc::clone(&calls);
    command.add_callback(move |finished| {
        assert_eq!(finished.text(), "true");
        seen.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(command.wait(WAIT), Some(0));
    assert_eq!(command.wait(WAIT), Some(0));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[rstest]
fn override_environment_wins_for_one_command(sandbox: Sandbox) {
    let worker = &sandbox.worker;
    worker.set_env("FOREMAN_GREETING", "hello");
    let mut overlay = Environment::new();
    overlay.insert(String::from("FOREMAN_GREETING"), String::from("bonjour"));

    let overridden = worker
        .execute_with("printf %s \"$FOREMAN_GREETING\"", Some(&overlay))
        .expect("execute");
    let plain = worker
        .execute("printf %s \"$FOREMAN_GREETING\"")
        .expect("execute");

    overridden.wait(WAIT);
    plain.wait(WAIT);
    assert_eq!(overridden.stdout(), b"bonjour");
    assert_eq!(plain.stdout(), b"hello");
    assert_eq!(worker.remove_env("FOREMAN_GREETING").as_deref(), Some("hello"));
}

#[rstest]
fn change_directory_resolves_against_the_worker(sandbox: Sandbox) {
    let worker = &sandbox.worker;
    std::fs::create_dir(sandbox.root.join("sub")).expect("mkdir");

    worker.change_directory("sub").expect("chdir sub");
    assert_eq!(worker.cwd(), sandbox.root.join("sub"));
    let command = worker.execute("printf x > marker").expect("execute");
    assert_eq!(command.wait(WAIT), Some(0));
    assert!(sandbox.root.join("sub/marker").is_file());

    worker.change_directory("./..").expect("chdir parent");
    assert_eq!(worker.cwd(), sandbox.root);
    assert!(matches!(
        worker.change_directory("missing"),
        Err(WorkerError::NotADirectory { .. })
    ));
    assert_eq!(worker.cwd(), sandbox.root);
}

#[rstest]
fn files_round_trip_through_the_worker(sandbox: Sandbox) {
    let worker = &sandbox.worker;
    let mut file = worker
        .open_file("hello.txt", OpenMode::Write)
        .expect("open for write");
    file.write_all(b"Hello world!\n").expect("write");
    drop(file);

    let attributes = worker.stat_file("hello.txt", true).expect("stat");
    assert_eq!(attributes.size, 13);
    assert!(attributes.is_file());
    assert!(worker.is_file("hello.txt").expect("is_file"));
    assert!(!worker.is_directory("hello.txt").expect("is_directory"));
    assert_eq!(
        worker.list_directory(".").expect("list"),
        vec![String::from("hello.txt")]
    );

    let mut contents = String::new();
    worker
        .open_file("hello.txt", OpenMode::Read)
        .expect("open for read")
        .read_to_string(&mut contents)
        .expect("read");
    assert_eq!(contents, "Hello world!\n");
}

#[rstest]
fn get_and_put_move_files(sandbox: Sandbox) {
    let worker = &sandbox.worker;
    let elsewhere = TempDir::new().expect("tempdir");
    let outside =
        Utf8PathBuf::from_path_buf(elsewhere.path().join("moved.txt")).expect("utf-8 path");
    std::fs::write(sandbox.root.join("report.txt"), b"data").expect("seed");

    worker
        .get_file("report.txt", outside.as_str())
        .expect("get_file");
    assert!(!sandbox.root.join("report.txt").exists());
    assert_eq!(std::fs::read(&outside).expect("read"), b"data");

    worker
        .put_file(outside.as_str(), "back.txt")
        .expect("put_file");
    assert!(!outside.exists());
    assert!(sandbox.root.join("back.txt").is_file());

    worker.remove_file("back.txt").expect("remove");
    assert!(!sandbox.root.join("back.txt").exists());
}

#[rstest]
fn close_cancels_every_outstanding_command(sandbox: Sandbox) {
    let worker = &sandbox.worker;
    let finished = worker.execute("true").expect("execute");
    finished.wait(WAIT);
    let running: Vec<_> = (0..2)
        .map(|_| worker.execute("sleep 5").expect("execute"))
        .collect();

    worker.close().expect("close");

    for command in &running {
        assert!(command.cancelled());
        assert_eq!(command.exit_status(), None);
    }
    assert!(finished.cancelled());
    assert_eq!(finished.exit_status(), Some(0));
    assert!(matches!(
        worker.close(),
        Err(WorkerError::AlreadyClosed { .. })
    ));
    assert!(matches!(
        worker.execute("true"),
        Err(WorkerError::WorkerClosed { .. })
    ));
}

/// Returns the worker when it has a Python interpreter; tests skip
/// themselves otherwise.
fn python_worker(sandbox: &Sandbox) -> Option<&LocalWorker> {
    let worker = &sandbox.worker;
    worker.python_executable().map(|_| worker)
}

#[rstest]
fn python_exit_status_is_reported(sandbox: Sandbox) {
    let Some(worker) = python_worker(&sandbox) else {
        return;
    };

    let command = worker
        .execute_python("import sys; sys.exit(5)", None)
        .expect("execute_python");

    assert_eq!(command.wait(WAIT), Some(5));
}

#[rstest]
fn multi_line_python_is_staged_and_cleaned_up(sandbox: Sandbox) {
    let Some(worker) = python_worker(&sandbox) else {
        return;
    };
    let mut overlay = Environment::new();
    overlay.insert(String::from("FOREMAN_WHO"), String::from("farm"));

    let command = worker
        .execute_python(
            "import os\nprint('hello ' + os.environ['FOREMAN_WHO'])\n",
            Some(&overlay),
        )
        .expect("execute_python");

    assert_eq!(command.wait(WAIT), Some(0));
    assert_eq!(command.output().stdout_text(), "hello farm\n");
    let script = command
        .text()
        .rsplit(' ')
        .next()
        .map(|quoted| quoted.trim_matches('\'').to_owned())
        .expect("script path");
    assert!(!Utf8PathBuf::from(script).exists());
}

#[rstest]
fn python_facts_are_probed(sandbox: Sandbox) {
    let Some(worker) = python_worker(&sandbox) else {
        return;
    };

    let version = worker.python_version().expect("version");
    assert!(version.major >= 2);
    let tmp = worker.tmp_directory().expect("tmp directory");
    assert!(worker.is_directory(tmp.as_str()).expect("is_directory"));
}
