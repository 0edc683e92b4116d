//! Small OS-facing helpers shared by both sides of the bridge.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The prefix used for every endpoint directory and group socket this bridge
/// creates under the temp root.
pub const ENDPOINT_PREFIX: &str = "plugbridge";

/// The interval between synchronizing the foreign audio thread's scheduling
/// priority with the native host's audio thread.
pub const AUDIO_THREAD_PRIORITY_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Reported instead of the actual host name when the `hide_daw` compatibility
/// option is enabled. Some plugins hardcode host-specific behavior that
/// misfires under the bridge.
pub const PRODUCT_NAME_OVERRIDE: &str = "Get bridged";
/// Reported instead of the actual vendor name when `hide_daw` is enabled.
pub const VENDOR_NAME_OVERRIDE: &str = "plugbridge";

/// The directory all socket endpoints live under. `YABRIDGE_TEMP_DIR`
/// overrides it, `$XDG_RUNTIME_DIR` is the usual value, and `/tmp` the
/// fallback of last resort.
pub fn get_temporary_directory() -> PathBuf {
    if let Ok(overridden) = std::env::var("YABRIDGE_TEMP_DIR") {
        if !overridden.is_empty() {
            return PathBuf::from(overridden);
        }
    }

    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Generate and create a unique base directory for a plugin's socket
/// endpoints, `<temp_root>/plugbridge-<plugin_name>-<8 alphanumeric chars>/`.
/// The suffix is regenerated until the candidate does not already exist.
pub fn generate_endpoint_base(plugin_name: &str) -> Result<PathBuf, io::Error> {
    let temp_dir = get_temporary_directory();

    loop {
        let suffix: String =
            rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect();
        let candidate = temp_dir.join(format!("{}-{}-{}", ENDPOINT_PREFIX, plugin_name, suffix));

        if !candidate.exists() {
            std::fs::create_dir_all(&candidate)?;
            return Ok(candidate);
        }
    }
}

/// Recursively remove an endpoint base directory, but only when it is
/// contained in the temp root. Socket base directories are passed around as
/// plain strings, and a mangled argument should never be able to wipe
/// anything outside of the temp directory.
pub fn remove_endpoint_base(base_dir: &Path) {
    let temp_dir = get_temporary_directory();

    if base_dir.starts_with(&temp_dir) {
        let _ = std::fs::remove_dir_all(base_dir);
    } else {
        log::warn!(
            "Unexpected socket base directory found, not removing '{}'",
            base_dir.display()
        );
    }
}

/// Whether the parent-pid watchdog has been disabled through
/// `YABRIDGE_NO_WATCHDOG=1`. Needed for namespaced setups where the parent
/// pid is not visible.
pub fn watchdog_disabled() -> bool {
    std::env::var("YABRIDGE_NO_WATCHDOG").map(|value| value == "1").unwrap_or(false)
}

/// Check whether a process with the given PID is still active and not a
/// zombie.
pub fn pid_running(pid: u32) -> bool {
    // Reading the stat line also catches zombies, which `kill(pid, 0)` would
    // report as alive
    // The process name in the stat line is parenthesized and may itself
    // contain spaces, so the state field is taken from after the last paren
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => match stat.rsplit(')').next() {
            Some(after_comm) => !after_comm.trim_start().starts_with('Z'),
            None => true,
        },
        Err(_) => false,
    }
}

/// Best-effort desktop notification for the situations where log output alone
/// is easy to miss (worker startup failures, version mismatches, resource
/// limits). Failures are ignored; the log line already carries the message.
pub fn send_notification(summary: &str, body: &str, origin: Option<&Path>) {
    let body = match origin {
        Some(origin) => format!("{}\n({})", body, origin.display()),
        None => body.to_owned(),
    };

    let _ = Command::new("notify-send")
        .args(["--app-name", ENDPOINT_PREFIX, "--urgency", "normal", summary, &body])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
}

/// Set or reset SCHED_FIFO scheduling for the calling thread with an explicit
/// priority. Returns whether the operation succeeded; it fails when the user
/// lacks realtime privileges.
///
/// The audio threads themselves are boosted with the `thread_priority` crate
/// when they spawn; this function exists for the periodic synchronization
/// which has to copy the host's exact priority value.
pub fn set_realtime_priority(sched_fifo: bool, priority: i32) -> bool {
    unsafe {
        let policy = if sched_fifo { libc::SCHED_FIFO } else { libc::SCHED_OTHER };
        let param = libc::sched_param { sched_priority: if sched_fifo { priority } else { 0 } };

        libc::pthread_setschedparam(libc::pthread_self(), policy, &param) == 0
    }
}

/// The calling thread's SCHED_FIFO priority, or `None` when the thread is not
/// under realtime scheduling. Used to copy the host's audio thread priority
/// onto the foreign audio thread.
pub fn get_realtime_priority() -> Option<i32> {
    unsafe {
        let mut policy: libc::c_int = 0;
        let mut param: libc::sched_param = std::mem::zeroed();

        if libc::pthread_getschedparam(libc::pthread_self(), &mut policy, &mut param) != 0 {
            return None;
        }

        if policy == libc::SCHED_FIFO {
            Some(param.sched_priority)
        } else {
            None
        }
    }
}

/// The soft `RLIMIT_RTTIME` limit in microseconds, or `None` if it could not
/// be fetched. `u64::MAX` means unlimited.
#[cfg(target_os = "linux")]
pub fn get_rttime_limit() -> Option<u64> {
    get_rlimit(libc::RLIMIT_RTTIME)
}

/// The soft `RLIMIT_MEMLOCK` limit in bytes, or `None` if it could not be
/// fetched. `u64::MAX` means unlimited.
pub fn get_memlock_limit() -> Option<u64> {
    get_rlimit(libc::RLIMIT_MEMLOCK)
}

fn get_rlimit(resource: libc::__rlimit_resource_t) -> Option<u64> {
    unsafe {
        let mut limit: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(resource, &mut limit) == 0 {
            Some(limit.rlim_cur)
        } else {
            None
        }
    }
}

/// A guard that enables flush-to-zero for denormals on the current thread and
/// restores the previous mode on every exit path. Wrapped around the foreign
/// plugin's process call.
pub struct ScopedFlushToZero {
    #[cfg(target_arch = "x86_64")]
    old_mxcsr: u32,
}

#[cfg(target_arch = "x86_64")]
const MXCSR_FLUSH_TO_ZERO: u32 = 0x8000;

impl Default for ScopedFlushToZero {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopedFlushToZero {
    #[cfg(target_arch = "x86_64")]
    pub fn new() -> Self {
        unsafe {
            let old_mxcsr = std::arch::x86_64::_mm_getcsr();
            std::arch::x86_64::_mm_setcsr(old_mxcsr | MXCSR_FLUSH_TO_ZERO);

            Self { old_mxcsr }
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn new() -> Self {
        Self {}
    }
}

impl Drop for ScopedFlushToZero {
    fn drop(&mut self) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            // Restore the previous mode, not a hardcoded default: the host
            // may have had FTZ enabled itself
            let current = std::arch::x86_64::_mm_getcsr();
            std::arch::x86_64::_mm_setcsr(
                (current & !MXCSR_FLUSH_TO_ZERO) | (self.old_mxcsr & MXCSR_FLUSH_TO_ZERO),
            );
        }
    }
}

/// A value cached for the duration of a scope. `set()` returns a guard, and
/// `get()` returns the value only while that guard is alive. Used to prefetch
/// transport info and the process level for one processing call so the
/// plugin's mid-process queries are answered locally.
pub struct ScopedValueCache<T: Clone> {
    value: Mutex<Option<T>>,
}

impl<T: Clone> Default for ScopedValueCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ScopedValueCache<T> {
    pub fn new() -> Self {
        Self { value: Mutex::new(None) }
    }

    pub fn get(&self) -> Option<T> {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Cache `value` until the returned guard goes out of scope.
    pub fn set(&self, value: T) -> ScopedValueCacheGuard<'_, T> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);

        ScopedValueCacheGuard { cache: self }
    }
}

pub struct ScopedValueCacheGuard<'a, T: Clone> {
    cache: &'a ScopedValueCache<T>,
}

impl<T: Clone> Drop for ScopedValueCacheGuard<'_, T> {
    fn drop(&mut self) {
        *self.cache.value.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// A value cached for a number of seconds. Imprecise by design; used for the
/// periodic realtime priority synchronization.
pub struct TimedValueCache<T: Clone> {
    value: Mutex<Option<(T, Instant)>>,
}

impl<T: Clone> Default for TimedValueCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> TimedValueCache<T> {
    pub fn new() -> Self {
        Self { value: Mutex::new(None) }
    }

    pub fn get(&self) -> Option<T> {
        let value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        match &*value {
            Some((value, valid_until)) if Instant::now() <= *valid_until => Some(value.clone()),
            _ => None,
        }
    }

    /// Like `get()`, but a hit also pushes the expiry out by `lifetime`.
    pub fn get_and_keep_alive(&self, lifetime: Duration) -> Option<T> {
        let mut entry = self.value.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *entry {
            Some((value, valid_until)) if Instant::now() <= *valid_until => {
                *valid_until = Instant::now() + lifetime;
                Some(value.clone())
            }
            _ => None,
        }
    }

    pub fn set(&self, value: T, lifetime: Duration) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((value, Instant::now() + lifetime));
    }
}

/// Serializes tests that touch the `YABRIDGE_TEMP_DIR` environment variable.
#[cfg(test)]
pub(crate) fn lock_test_env() -> std::sync::MutexGuard<'static, ()> {
    static ENV_LOCK: Mutex<()> = Mutex::new(());
    ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_base_is_contained_and_unique() {
        let _env = lock_test_env();
        let scratch = tempfile::tempdir().unwrap();
        std::env::set_var("YABRIDGE_TEMP_DIR", scratch.path());

        let first = generate_endpoint_base("TestPlugin").unwrap();
        let second = generate_endpoint_base("TestPlugin").unwrap();

        assert_ne!(first, second);
        assert!(first.starts_with(scratch.path()));
        assert!(first.is_dir());

        let name = first.file_name().unwrap().to_str().unwrap();
        let suffix = name.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));

        remove_endpoint_base(&first);
        assert!(!first.exists());

        std::env::remove_var("YABRIDGE_TEMP_DIR");
    }

    #[test]
    fn removal_refuses_paths_outside_the_temp_root() {
        let _env = lock_test_env();
        let scratch = tempfile::tempdir().unwrap();
        std::env::set_var("YABRIDGE_TEMP_DIR", scratch.path());

        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("plugbridge-victim");
        std::fs::create_dir_all(&victim).unwrap();

        remove_endpoint_base(&victim);
        assert!(victim.exists());

        std::env::remove_var("YABRIDGE_TEMP_DIR");
    }

    #[test]
    fn own_pid_is_running() {
        assert!(pid_running(std::process::id()));
        // PIDs wrap below this on Linux, so this one can't exist
        assert!(!pid_running(u32::MAX));
    }

    #[test]
    fn flush_to_zero_guard_restores_the_previous_mode() {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            let original = std::arch::x86_64::_mm_getcsr();

            {
                let _guard = ScopedFlushToZero::new();
                assert_ne!(std::arch::x86_64::_mm_getcsr() & MXCSR_FLUSH_TO_ZERO, 0);
            }
            assert_eq!(
                std::arch::x86_64::_mm_getcsr() & MXCSR_FLUSH_TO_ZERO,
                original & MXCSR_FLUSH_TO_ZERO
            );

            // With FTZ already enabled the guard must not disable it
            std::arch::x86_64::_mm_setcsr(original | MXCSR_FLUSH_TO_ZERO);
            {
                let _guard = ScopedFlushToZero::new();
            }
            assert_ne!(std::arch::x86_64::_mm_getcsr() & MXCSR_FLUSH_TO_ZERO, 0);

            std::arch::x86_64::_mm_setcsr(original);
        }
    }

    #[test]
    fn scoped_cache_clears_on_guard_drop() {
        let cache: ScopedValueCache<i32> = ScopedValueCache::new();
        assert_eq!(cache.get(), None);

        {
            let _guard = cache.set(3);
            assert_eq!(cache.get(), Some(3));
        }
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn timed_cache_expires() {
        let cache: TimedValueCache<i32> = TimedValueCache::new();

        cache.set(5, Duration::from_secs(60));
        assert_eq!(cache.get(), Some(5));

        cache.set(5, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(), None);
    }
}
