//! Host readiness checks

use anyhow::Result;

use capsule_daemon::config::Configuration;

/// Print the resolved configuration and check host prerequisites.
pub async fn run(config_path: &str) -> Result<()> {
    let config = Configuration::load(config_path)?;

    println!("capsule-daemon v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Configuration ({}):", config_path);
    println!(
        "  shared mounts dir:  {}",
        config.agent.shared_mounts_dir.display()
    );
    println!(
        "  runtime config:     {}",
        config.agent.runtime_config_path.display()
    );
    println!("  shutdown timeout:   {}s", config.agent.shutdown_timeout);
    println!(
        "  service manifests:  {}",
        config.agent.service_manifest_dir.display()
    );
    println!();

    let mut ok = true;

    ok &= check(
        "shared mounts dir writable",
        is_writable(&config.agent.shared_mounts_dir),
    );
    ok &= check(
        "runtime config present",
        config.agent.runtime_config_path.is_file(),
    );
    ok &= check("dbus-proxy on PATH", binary_on_path("dbus-proxy"));

    if config.network.enabled {
        let bridge = std::path::Path::new("/sys/class/net").join(&config.network.bridge_device);
        ok &= check(
            &format!("bridge device {} present", config.network.bridge_device),
            bridge.exists(),
        );
    }

    if !ok {
        anyhow::bail!("One or more diagnostics failed");
    }

    println!();
    println!("All diagnostics passed");
    Ok(())
}

fn check(label: &str, ok: bool) -> bool {
    println!("  [{}] {}", if ok { "ok" } else { "!!" }, label);
    ok
}

fn is_writable(dir: &std::path::Path) -> bool {
    let probe = dir.join(".capsule-diagnostics");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

fn binary_on_path(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
        })
        .unwrap_or(false)
}
