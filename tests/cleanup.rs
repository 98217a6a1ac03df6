//! Best-effort removal of files orphaned by dead processes.

#![cfg(target_os = "linux")]

use naos::Class;

#[test]
fn test_cleanup_removes_orphaned_files() {
    let name = format!("orphan-{}", std::process::id());
    let class = Class::initialize(&format!("sm://{name}"), true).unwrap();

    let shm_path = format!("/dev/shm/naos-{name}");
    let sock_dir = format!("/tmp/naos-{name}");
    assert!(std::path::Path::new(&shm_path).exists());
    assert!(std::path::Path::new(&sock_dir).exists());

    // Simulate a crashed process: the class is never finalized.
    std::mem::forget(class);
    assert!(std::path::Path::new(&shm_path).exists());

    naos::cleanup();
    assert!(!std::path::Path::new(&shm_path).exists());
    assert!(!std::path::Path::new(&sock_dir).exists());

    // A fresh endpoint can reuse the name afterwards.
    let class = Class::initialize(&format!("sm://{name}"), true).unwrap();
    class.finalize().map_err(|(_, e)| e).unwrap();
    assert!(!std::path::Path::new(&shm_path).exists());
}
