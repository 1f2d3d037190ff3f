use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::command::{CommandFailure, CommandRunner, Invocation};

/// Monotonically increasing counter for generating unique test resource names.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether we have sufficient privileges (root/sudo) and tools (`ip`)
/// available to create network namespaces. Returns `false` if the test
/// environment cannot support namespace-based tests.
pub fn check_privileges() -> bool {
    match Command::new("ip").arg("netns").output() {
        Ok(o) => o.status.success(),
        Err(_) => false,
    }
}

/// How namespace commands must be prefixed here: `Some(false)` when already
/// root, `Some(true)` when passwordless `sudo` works, `None` when neither.
pub fn sudo_requirement() -> Option<bool> {
    let uid = Command::new("id").arg("-u").output().ok()?;
    if String::from_utf8_lossy(&uid.stdout).trim() == "0" {
        return Some(false);
    }
    match Command::new("sudo").args(["-n", "true"]).output() {
        Ok(o) if o.status.success() => Some(true),
        _ => None,
    }
}

/// Generates a unique namespace name with the given prefix, truncated to the
/// 15 character Linux limit.
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let name = format!("{}_{:x}_{}", prefix, pid % 0xFFFF, seq);
    if name.len() > 15 {
        name[..15].to_string()
    } else {
        name
    }
}

type Responder = dyn Fn(&[String]) -> Result<String, CommandFailure> + Send + Sync;

/// [`CommandRunner`] that records every argv and answers from a closure.
///
/// Safe to share across worker threads; the log keeps arrival order.
pub struct ScriptedRunner {
    log: Mutex<Vec<Vec<String>>>,
    respond: Box<Responder>,
}

impl ScriptedRunner {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&[String]) -> Result<String, CommandFailure> + Send + Sync + 'static,
    {
        Self {
            log: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    /// Every argv seen so far, in call order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation<'_>) -> Result<String, CommandFailure> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation.argv.to_vec());
        (self.respond)(invocation.argv)
    }
}

/// Renders `ping` output for `count` echoes with the given average RTT.
pub fn ping_output(peer: &str, count: u32, avg_ms: &str) -> String {
    let mut out = format!("PING {peer} ({peer}) 56(84) bytes of data.\n");
    for seq in 1..=count {
        out.push_str(&format!(
            "64 bytes from {peer}: icmp_seq={seq} ttl=64 time={avg_ms} ms\n"
        ));
    }
    out.push_str(&format!("\n--- {peer} ping statistics ---\n"));
    out.push_str(&format!(
        "{count} packets transmitted, {count} received, 0% packet loss, time {}ms\n",
        count.saturating_sub(1) * 1000
    ));
    out.push_str(&format!(
        "rtt min/avg/max/mdev = {avg_ms}/{avg_ms}/{avg_ms}/0.000 ms\n"
    ));
    out
}
