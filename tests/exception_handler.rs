//! Faults on a process with the handler enabled produce a report, a crash
//! snapshot, and then whatever the configured response says.

mod common;

use std::{fmt::Write as _, fs, path::Path, sync::Arc};

use common::{run_in_child, scratch_dir, serial, ChildExit};
use kdiag::exception::{
    info::ExceptionInfo,
    report::{Minidump, MINIDUMP_VERSION},
    ExceptionHandler, ExceptionKind, ExceptionListener, ExceptionResponse,
};

fn handler_writing_to(dir: &Path) -> Arc<ExceptionHandler> {
    let handler = Arc::new(ExceptionHandler::new());
    let report = dir.join("report.txt");
    let dump = dir.join("dump.kdmp");
    handler
        .set_exception_paths(report.to_str(), dump.to_str())
        .unwrap();
    handler.set_app_description("integration test");
    handler.set_code_base_directory_paths(&["/src/kdiag"]).unwrap();
    handler
}

#[test]
fn access_violation_writes_a_report_and_terminates() {
    let _guard = serial();
    let dir = scratch_dir("access-violation");
    let exit = run_in_child(|| {
        let handler = handler_writing_to(&dir);
        handler.set_terminate_return_value(42);
        handler.enable(true).unwrap();
        ExceptionHandler::create_exception(ExceptionKind::AccessViolation);
        unreachable!("the handler terminates");
    });
    assert_eq!(exit, ChildExit::Exited(42));

    let report = fs::read_to_string(dir.join("report.txt")).unwrap();
    for section in [
        "Exception Info",
        "Time (UTC): ",
        "Signal: SIGSEGV",
        "App description: integration test",
        "Code base path: /src/kdiag",
        "\nBacktrace\n",
        "\nThread callstacks\n",
        "(exception thread)",
        "\nModule list\n",
        "Base: 0x",
        "\nSystem Info\n",
        "Disabled by report privacy settings",
    ] {
        assert!(report.contains(section), "missing {section:?} in:\n{report}");
    }
    assert!(!report.contains("Host name"));

    let dump = Minidump::read(dir.join("dump.kdmp")).unwrap();
    assert_eq!(dump.version, MINIDUMP_VERSION);
    assert!(dump.description.starts_with("SIGSEGV"));
    assert!(!dump.backtrace.is_empty());
    assert!(!dump.modules.is_empty());
    assert_ne!(dump.memory_address, 0);
    fs::remove_dir_all(&dir).unwrap();
}

struct Marker;

impl ExceptionListener for Marker {
    fn handle_exception(
        &self,
        user_value: usize,
        handler: &ExceptionHandler,
        _info: &ExceptionInfo,
        report_path: &str,
    ) {
        assert!(!report_path.is_empty());
        let mut line = kdiag::util::fixed::FixedStr::<64>::new();
        let _ = write!(line, "listener saw {user_value:#x}");
        handler.write_report_line(line.as_str());
    }
}

// Rust's own threads come with an alternate signal stack too small for a
// report writer; the handler switches to its emergency stack there
#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[test]
fn fault_on_a_plain_std_thread_is_reported() {
    let _guard = serial();
    let dir = scratch_dir("std-thread");
    let exit = run_in_child(|| {
        let handler = handler_writing_to(&dir);
        handler.set_terminate_return_value(42);
        handler.enable(true).unwrap();
        let _ = std::thread::Builder::new()
            .name("plain-std".to_owned())
            .spawn(|| ExceptionHandler::create_exception(ExceptionKind::AccessViolation))
            .unwrap()
            .join();
    });
    assert_eq!(exit, ChildExit::Exited(42));

    let report = fs::read_to_string(dir.join("report.txt")).unwrap();
    for section in ["Signal: SIGSEGV", "Thread name: plain-std", "\nModule list\n"] {
        assert!(report.contains(section), "missing {section:?} in:\n{report}");
    }
    assert!(Minidump::read(dir.join("dump.kdmp")).is_ok());
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn fault_on_a_system_worker_is_reported() {
    let _guard = serial();
    let dir = scratch_dir("system-worker");
    let exit = run_in_child(|| {
        kdiag::System::init(None);
        let handler = handler_writing_to(&dir);
        handler.set_terminate_return_value(42);
        handler.enable(true).unwrap();
        kdiag::System::spawn_thread("kdiag-worker", || {
            ExceptionHandler::create_exception(ExceptionKind::AccessViolation)
        })
        .unwrap();
        // the fault ends the process long before this
        std::thread::sleep(std::time::Duration::from_secs(10));
    });
    assert_eq!(exit, ChildExit::Exited(42));

    let report = fs::read_to_string(dir.join("report.txt")).unwrap();
    for section in ["Signal: SIGSEGV", "Thread name: kdiag-worker", "(exception thread)"] {
        assert!(report.contains(section), "missing {section:?} in:\n{report}");
    }
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn listener_runs_with_the_report_open_and_rethrow_kills() {
    let _guard = serial();
    let dir = scratch_dir("listener");
    let exit = run_in_child(|| {
        let handler = handler_writing_to(&dir);
        handler.set_exception_listener(Some(Arc::new(Marker)), 0xfeed);
        handler.set_exception_response(ExceptionResponse::Rethrow);
        handler.enable_report_privacy(false);
        handler.enable(true).unwrap();
        ExceptionHandler::create_exception(ExceptionKind::IllegalInstruction);
    });
    assert_eq!(exit, ChildExit::Signaled(libc::SIGILL));

    let report = fs::read_to_string(dir.join("report.txt")).unwrap();
    assert!(report.contains("listener saw 0xfeed"), "{report}");
    assert!(report.contains("Host name: "));
    assert!(!report.contains("Disabled by report privacy settings"));
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn handle_normally_defers_to_the_default_action() {
    let _guard = serial();
    let dir = scratch_dir("handle-normally");
    let exit = run_in_child(|| {
        let handler = handler_writing_to(&dir);
        handler.set_exception_response(ExceptionResponse::HandleNormally);
        handler.enable(true).unwrap();
        ExceptionHandler::create_exception(ExceptionKind::AccessViolation);
    });
    assert!(exit.is_memory_fault(), "{exit:?}");
    assert!(dir.join("report.txt").exists());
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn paused_handler_writes_nothing() {
    let _guard = serial();
    let dir = scratch_dir("paused");
    let exit = run_in_child(|| {
        let handler = handler_writing_to(&dir);
        handler.enable(true).unwrap();
        handler.pause_handling(true);
        ExceptionHandler::create_exception(ExceptionKind::Abort);
    });
    assert_eq!(exit, ChildExit::Signaled(libc::SIGABRT));
    assert!(!dir.join("report.txt").exists());
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn enable_and_disable_restore_previous_handlers() {
    let _guard = serial();
    let exit = run_in_child(|| {
        let handler = Arc::new(ExceptionHandler::new());
        handler.set_exception_paths(None, None).unwrap();
        handler.enable(true).unwrap();
        assert!(handler.is_enabled());
        assert!(handler.enable(true).is_err());
        let other = Arc::new(ExceptionHandler::new());
        assert!(other.enable(true).is_err());
        handler.enable(false).unwrap();
        assert!(!handler.is_enabled());
        other.enable(true).unwrap();
        other.enable(false).unwrap();
        // back to the default action
        ExceptionHandler::create_exception(ExceptionKind::DivideByZero);
    });
    assert_eq!(exit, ChildExit::Signaled(libc::SIGFPE));
}

#[cfg(not(target_vendor = "apple"))]
#[test]
fn deadlock_report_is_written_without_a_fault() {
    let _guard = serial();
    let dir = scratch_dir("deadlock");
    let exit = run_in_child(|| {
        std::env::set_var("XDG_DATA_HOME", &dir);
        let path = ExceptionHandler::report_deadlock("watchdog", "Kdiag", "Tests").unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("Deadlock detected in thread \"watchdog\""), "{text}");
        assert!(path.starts_with(&dir));
    });
    assert_eq!(exit, ChildExit::Exited(0));
    fs::remove_dir_all(&dir).unwrap();
}
