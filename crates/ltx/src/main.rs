#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("ltx requires Linux (epoll, signalfd, splice)");
    std::process::exit(2);
}

#[cfg(target_os = "linux")]
fn main() {
    let code = linux::run();
    unsafe { libc::_exit(code) }
}

#[cfg(target_os = "linux")]
mod linux;
