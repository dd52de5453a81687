//! Leak a few blocks on purpose and let `System::destroy` report them.
//!
//! `KDIAG_LOG=info cargo run --example leak_report`

use kdiag::{alloc, kdiag_alloc, Config, System};

fn main() -> kdiag::Result<()> {
    let mut config = Config::from_env()?;
    config.leak_tracking = true;
    config.allocator.kind = kdiag::config::AllocatorKind::DebugPage;
    System::init_with_config(&config)?;
    System::set_assert_on_leaks(false);

    let kept = kdiag_alloc!(64)?;
    for size in [16, 256, 4096] {
        let p = alloc::alloc(size)?;
        // SAFETY: live, from `alloc`
        unsafe { alloc::free(p) };
    }
    let _ = kept;

    let leaks = System::destroy();
    println!("{} leak(s) reported", leaks.unwrap_or(0));
    Ok(())
}
