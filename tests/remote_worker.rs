//! Behavioural tests for remote workers over a scripted session.

use std::io::{Read, Write};
use std::time::Duration;

use camino::Utf8PathBuf;
use foreman::test_support::{ExecInvocation, ScriptedSession, Step};
use foreman::{OpenMode, RemoteWorker, TransportError, Worker, WorkerError};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

struct Remote {
    session: ScriptedSession,
    worker: RemoteWorker<ScriptedSession>,
}

#[fixture]
fn remote() -> Remote {
    let session = ScriptedSession::with_bootstrap(
        "/home/ci",
        &[
            ("HOME", "/home/ci"),
            ("LANG", "C"),
            ("SSH_CLIENT", "10.0.0.1 50000 22"),
            ("SSH_CONNECTION", "10.0.0.1 50000 10.0.0.2 22"),
        ],
    );
    let worker = RemoteWorker::with_session(session.clone(), "ci", "farm-1").expect("bootstrap");
    Remote { session, worker }
}

fn last_exec(session: &ScriptedSession) -> ExecInvocation {
    session
        .exec_invocations()
        .last()
        .cloned()
        .expect("an exec call")
}

#[rstest]
fn bootstrap_imports_directory_and_filtered_environment(remote: Remote) {
    let Remote { worker, .. } = remote;

    assert_eq!(worker.cwd(), Utf8PathBuf::from("/home/ci"));
    assert_eq!(worker.core().to_string(), "<Worker user=ci host=farm-1>");
    let environment = worker.environment();
    assert_eq!(environment.get("LANG").map(String::as_str), Some("C"));
    assert!(!environment.contains_key("SSH_CLIENT"));
    assert!(!environment.contains_key("SSH_CONNECTION"));
}

#[rstest]
fn commands_export_environment_and_enter_the_working_directory(remote: Remote) {
    let Remote { session, worker } = remote;
    worker.set_env("CC", "clang");
    session.push_channel(vec![Step::Stdout(b"built".to_vec()), Step::Exit(0)]);

    let command = worker.execute("make all").expect("execute");

    assert_eq!(command.wait(WAIT), Some(0));
    assert_eq!(command.stdout(), b"built");
    let opened = session.opened_commands();
    let rendered = opened.first().expect("one channel");
    assert!(rendered.contains("export CC=clang; "), "rendered: {rendered}");
    assert!(rendered.ends_with("cd /home/ci && make all"), "rendered: {rendered}");
}

#[rstest]
fn transient_read_failures_do_not_end_the_command(remote: Remote) {
    let Remote { session, worker } = remote;
    session.push_channel(vec![
        Step::Stderr(b"warming up".to_vec()),
        Step::Fail(TransportError::Channel {
            message: String::from("window adjust lost"),
        }),
        Step::Stdout(b"late".to_vec()),
        Step::Exit(4),
    ]);

    let command = worker.execute("flaky").expect("execute");

    assert_eq!(command.wait(WAIT), Some(4));
    assert_eq!(command.stdout(), b"late");
    assert_eq!(command.stderr(), b"warming up");
}

#[rstest]
fn cancel_closes_the_channel(remote: Remote) {
    let Remote { session, worker } = remote;
    session.push_channel(vec![Step::Stdout(b"partial".to_vec())]);

    let command = worker.execute("tail -f log").expect("execute");
    assert_eq!(command.wait(Some(Duration::from_millis(100))), None);
    command.cancel().expect("cancel");

    assert!(session.channel_closed(0));
    assert_eq!(command.exit_status(), None);
    assert!(command.cancelled());
}

#[rstest]
fn close_cancels_commands_and_closes_the_session(remote: Remote) {
    let Remote { session, worker } = remote;
    session.push_channel(vec![Step::Stdout(b"tick".to_vec())]);
    let command = worker.execute("watch date").expect("execute");

    worker.close().expect("close");

    assert!(command.cancelled());
    assert!(session.is_closed());
    assert!(matches!(
        worker.close(),
        Err(WorkerError::AlreadyClosed { .. })
    ));
    assert!(matches!(
        worker.execute("true"),
        Err(WorkerError::WorkerClosed { .. })
    ));
}

#[rstest]
fn change_directory_checks_the_remote_path(remote: Remote) {
    let Remote { session, worker } = remote;
    session.push_exec(0, "", "");
    worker.change_directory("src").expect("chdir");
    assert_eq!(worker.cwd(), Utf8PathBuf::from("/home/ci/src"));
    assert_eq!(last_exec(&session).command, "test -d /home/ci/src");

    session.push_exec(1, "", "");
    assert!(matches!(
        worker.change_directory("../missing"),
        Err(WorkerError::NotADirectory { .. })
    ));
    assert_eq!(worker.cwd(), Utf8PathBuf::from("/home/ci/src"));
}

#[rstest]
fn written_files_upload_on_flush(remote: Remote) {
    let Remote { session, worker } = remote;
    let mut file = worker
        .open_file("notes.txt", OpenMode::Write)
        .expect("open");
    file.write_all(b"Hello world!\n").expect("write");
    file.flush().expect("flush");

    let upload = last_exec(&session);
    assert_eq!(upload.command, "cat > /home/ci/notes.txt");
    assert_eq!(upload.input.as_deref(), Some(b"Hello world!\n".as_slice()));
}

#[rstest]
fn read_files_download_on_open(remote: Remote) {
    let Remote { session, worker } = remote;
    session.push_exec(0, "Hello world!\n", "");

    let mut contents = String::new();
    worker
        .open_file("~/notes.txt", OpenMode::Read)
        .expect("open")
        .read_to_string(&mut contents)
        .expect("read");

    assert_eq!(contents, "Hello world!\n");
    assert_eq!(last_exec(&session).command, "cat -- /home/ci/notes.txt");
}

#[rstest]
fn stat_parses_the_remote_report(remote: Remote) {
    let Remote { session, worker } = remote;
    session.push_exec(0, "81a4 12 34 1 1000 1000 13 1700000000 1700000001 1700000002\n", "");

    let attributes = worker.stat_file("notes.txt", true).expect("stat");

    assert_eq!(attributes.size, 13);
    assert!(attributes.is_file());
    assert!(last_exec(&session).command.starts_with("stat -L -c "));
}

#[rstest]
fn get_file_moves_the_remote_file(remote: Remote) {
    let Remote { session, worker } = remote;
    let tmp = TempDir::new().expect("tempdir");
    let local = Utf8PathBuf::from_path_buf(tmp.path().join("fetched.txt")).expect("utf-8 path");
    session.push_exec(0, "payload", "");
    session.push_exec(0, "", "");

    worker
        .get_file("out/result.txt", local.as_str())
        .expect("get_file");

    assert_eq!(std::fs::read(&local).expect("read local"), b"payload");
    let commands: Vec<String> = session
        .exec_invocations()
        .into_iter()
        .map(|invocation| invocation.command)
        .collect();
    assert!(commands.contains(&String::from("cat -- /home/ci/out/result.txt")));
    assert!(commands.contains(&String::from("rm -f -- /home/ci/out/result.txt")));
}

#[rstest]
fn failed_remote_operations_report_status_and_stderr(remote: Remote) {
    let Remote { session, worker } = remote;
    session.push_exec(2, "", "ls: cannot access 'nope'");

    let err = worker.list_directory("nope").expect_err("listing should fail");

    assert!(matches!(
        err,
        WorkerError::Remote { ref operation, status: Some(2), ref stderr, .. }
            if operation == "list" && stderr.contains("cannot access")
    ));
}

#[rstest]
fn single_line_python_runs_inline(remote: Remote) {
    let Remote { session, worker } = remote;
    session.push_channel(vec![Step::Stdout(b"/usr/bin/python3\n".to_vec()), Step::Exit(0)]);
    session.push_channel(vec![Step::Exit(5)]);

    let command = worker
        .execute_python("import sys; sys.exit(5)", None)
        .expect("execute_python");

    assert_eq!(command.wait(WAIT), Some(5));
    let opened = session.opened_commands();
    let inline = opened.get(1).expect("python channel");
    assert!(
        inline.ends_with("/usr/bin/python3 -c 'import sys; sys.exit(5)'"),
        "rendered: {inline}"
    );
    assert_eq!(worker.python_executable().as_deref(), Some("/usr/bin/python3"));
    assert_eq!(session.opened_commands().len(), 2);
}

#[rstest]
fn multi_line_python_is_staged_run_and_removed(remote: Remote) {
    let Remote { session, worker } = remote;
    session.push_channel(vec![Step::Stdout(b"/usr/bin/python3\n".to_vec()), Step::Exit(0)]);
    session.push_channel(vec![Step::Stdout(b"/tmp\n".to_vec()), Step::Exit(0)]);
    session.push_channel(vec![Step::Stdout(b"hello\n".to_vec()), Step::Exit(0)]);
    let code = "import sys\nprint('hello')\n";

    let command = worker.execute_python(code, None).expect("execute_python");

    let staged = last_exec(&session);
    assert!(
        staged.command.starts_with("cat > /tmp/foreman-"),
        "staged with: {}",
        staged.command
    );
    assert_eq!(staged.input.as_deref(), Some(code.as_bytes()));
    let script = staged.command.trim_start_matches("cat > ").to_owned();

    assert_eq!(command.wait(WAIT), Some(0));
    assert_eq!(command.stdout(), b"hello\n");
    let opened = session.opened_commands();
    let run = opened.get(2).expect("script channel");
    assert!(
        run.ends_with(&format!("cd /home/ci && /usr/bin/python3 {script}")),
        "rendered: {run}"
    );
    assert_eq!(last_exec(&session).command, format!("rm -- {script}"));
}
