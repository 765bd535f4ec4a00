use std::ffi::{CStr, c_char, c_int, c_void};
use std::sync::Once;

use ffmpeg_next::ffi;
use ffmpeg_next::util::log::Level as FfmpegLogLevel;
use tracing::{Level, debug, event};

static INSTALL_CALLBACK: Once = Once::new();

// Matches the platform ABI of C's `va_list` as FFmpeg's bindings declare it.
#[cfg(any(
    all(
        not(target_arch = "aarch64"),
        not(target_arch = "powerpc"),
        not(target_arch = "s390x"),
        not(target_arch = "x86_64")
    ),
    all(target_arch = "aarch64", target_vendor = "apple"),
    target_family = "wasm",
    target_os = "uefi",
    windows,
))]
type VaListType = *mut c_char;

#[cfg(all(target_arch = "x86_64", not(target_os = "uefi"), not(windows)))]
type VaListType = *mut ffi::__va_list_tag;

#[cfg(all(
    target_arch = "aarch64",
    not(target_vendor = "apple"),
    not(target_os = "uefi"),
    not(windows),
))]
type VaListType = *mut c_void;

#[cfg(all(target_arch = "powerpc", not(target_os = "uefi"), not(windows)))]
type VaListType = *mut ffi::__va_list_tag_powerpc;

#[cfg(target_arch = "s390x")]
type VaListType = *mut ffi::__va_list_tag_s390x;

/// Routes FFmpeg's own log lines into `tracing` under the `ffmpeg` target,
/// keeping FFmpeg's level as the first filter.
pub(crate) fn install(level: FfmpegLogLevel) {
    ffmpeg_next::util::log::set_level(level);
    INSTALL_CALLBACK.call_once(|| {
        unsafe { ffi::av_log_set_callback(Some(ffmpeg_log_callback)) };
        debug!("FFmpeg logs routed to tracing");
    });
}

/// Tracing level for an `AV_LOG_*` value; `None` for `AV_LOG_QUIET`.
fn tracing_level(level: c_int) -> Option<Level> {
    let level = match level {
        l if l < ffi::AV_LOG_PANIC => return None,
        l if l <= ffi::AV_LOG_ERROR => Level::ERROR,
        l if l <= ffi::AV_LOG_WARNING => Level::WARN,
        l if l <= ffi::AV_LOG_INFO => Level::INFO,
        l if l <= ffi::AV_LOG_DEBUG => Level::DEBUG,
        _ => Level::TRACE,
    };
    Some(level)
}

unsafe extern "C" fn ffmpeg_log_callback(
    ptr: *mut c_void,
    level: c_int,
    fmt: *const c_char,
    args: VaListType,
) {
    if level > unsafe { ffi::av_log_get_level() } {
        return;
    }
    let Some(tracing_level) = tracing_level(level) else {
        return;
    };

    let mut buffer = [0u8; 1024];
    let mut print_prefix = 1;
    unsafe {
        ffi::av_log_format_line(
            ptr,
            level,
            fmt,
            args,
            buffer.as_mut_ptr() as *mut c_char,
            buffer.len() as c_int,
            &mut print_prefix,
        );
    }

    let Ok(line) = CStr::from_bytes_until_nul(&buffer) else {
        return;
    };
    let message = line.to_string_lossy();
    let message = message.trim_end_matches(['\n', '\r']);
    if message.is_empty() {
        return;
    }

    match tracing_level {
        Level::ERROR => event!(target: "ffmpeg", Level::ERROR, "{message}"),
        Level::WARN => event!(target: "ffmpeg", Level::WARN, "{message}"),
        Level::INFO => event!(target: "ffmpeg", Level::INFO, "{message}"),
        Level::DEBUG => event!(target: "ffmpeg", Level::DEBUG, "{message}"),
        _ => event!(target: "ffmpeg", Level::TRACE, "{message}"),
    }
}
