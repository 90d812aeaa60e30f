//! Two members sharing one memory group
//!
//! Needs root or a delegated cgroup v2 subtree:
//!   sudo cargo run -p memgroup --example two_members

use memgroup::{ProcessLauncher, ResourceGroupManager};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== memgroup - Two Members ===\n");

    let manager = ResourceGroupManager::builder("memgroup-example", 0)
        .per_process_limit_str("50M")?
        .build()?;
    manager.materialize()?;
    println!("[*] Created group: {}", manager.group_path().display());

    let mut children = Vec::new();
    for i in 1..=2 {
        let launched = ProcessLauncher::spawn("sleep", &["30".to_string()])?;
        let Some(handle) = launched.handle.as_ref() else {
            return Err(format!("no handle for pid {}", launched.pid()).into());
        };
        std::thread::sleep(Duration::from_millis(200));
        manager.attach(handle)?;

        let limits = manager.limits()?;
        println!(
            "[{}] pid {} attached, aggregate cap {:?} bytes",
            i,
            handle.pid(),
            limits.aggregate_memory_limit
        );
        children.push(launched);
    }

    println!("[*] Members: {}", manager.member_count()?);

    manager.close()?;
    for mut child in children {
        let status = child.child.wait()?;
        println!("[*] pid {} ended: {}", child.pid(), status);
    }

    Ok(())
}
