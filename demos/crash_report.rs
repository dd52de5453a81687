//! Crash on purpose with the handler enabled and print where the report went.
//!
//! `cargo run --example crash_report -- [segv|bus|fpe|ill|trap|abort]`

use std::sync::Arc;

use kdiag::{
    exception::{info::ExceptionInfo, ExceptionHandler, ExceptionKind, ExceptionListener},
    raw_eprintln, System,
};

struct Announce;

impl ExceptionListener for Announce {
    fn handle_exception(&self, _: usize, handler: &ExceptionHandler, info: &ExceptionInfo, report_path: &str) {
        raw_eprintln!("caught {} on thread {}", info.description, info.thread_sys_id);
        raw_eprintln!("report: {report_path}");
        handler.write_report_line("\nThe crash_report demo was here.\n");
    }
}

fn main() -> kdiag::Result<()> {
    System::init(None);

    let kind = match std::env::args().nth(1).as_deref() {
        Some("bus") => ExceptionKind::BusError,
        Some("fpe") => ExceptionKind::DivideByZero,
        Some("ill") => ExceptionKind::IllegalInstruction,
        Some("trap") => ExceptionKind::Trap,
        Some("abort") => ExceptionKind::Abort,
        _ => ExceptionKind::AccessViolation,
    };

    let handler = Arc::new(ExceptionHandler::new());
    handler.set_paths_from_names("kdiag", "crash_report", None, None)?;
    handler.set_app_description("kdiag crash_report demo");
    handler.set_exception_listener(Some(Arc::new(Announce)), 0);
    handler.enable(true)?;
    println!("writing reports to {}", handler.report_path());

    ExceptionHandler::create_exception(kind);
    unreachable!("the handler terminates the process");
}
