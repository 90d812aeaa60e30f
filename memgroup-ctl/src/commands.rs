use log::info;
use memgroup::{SystemCapabilities, cgroup_root_path};
use std::path::Path;

pub fn check_requirements(root: Option<&Path>) {
    info!("Checking memory group requirements");
    println!("Checking memory group requirements...\n");

    let root = root.map(Path::to_path_buf).unwrap_or_else(cgroup_root_path);
    let caps = SystemCapabilities::detect_at(&root);
    println!("{}", caps.summary());

    println!("\nGroup root: {}", root.display());

    if caps.can_manage_groups() {
        println!("[ok] Memory groups can be created here");
    } else {
        println!("[--] Memory groups are NOT available (need cgroup v2 with the memory controller, and root or a delegated subtree)");
    }
    if !caps.has_cgroup_kill {
        println!("     members will be killed one by one on close (no cgroup.kill)");
    }

    println!("\nSystem info:");
    println!("  UID: {}", memgroup::util::get_uid());
}
