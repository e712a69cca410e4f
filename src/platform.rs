//! The platform seam: shared-library loading, symbol resolution, file timestamps, and sibling
//! binary discovery. Everything above this module talks to a [`Platform`] trait object so the
//! dispatcher can be exercised against an in-process test double, the same way the standalone
//! audio backends hide behind one trait with a dummy implementation.

use std::ffi::OsStr;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// An opaque handle to a loaded library: an index into the platform's own arena, never a raw
/// pointer, so rule and state rows can hold it freely.
pub type LibHandle = usize;

/// A resolved symbol address. The dispatcher transmutes this into one of the five trampoline
/// shapes right before the call.
pub type SymbolAddr = *const c_void;

pub trait Platform {
    /// Load the shared library at `path`, returning a handle usable with
    /// [`resolve_symbol`](Platform::resolve_symbol). Returns `None` when the library cannot be
    /// loaded.
    fn open_library(&mut self, path: &str) -> Option<LibHandle>;

    /// Resolve an exported symbol by name. Returns `None` for unknown handles and symbols.
    fn resolve_symbol(&mut self, handle: LibHandle, name: &str) -> Option<SymbolAddr>;

    /// Close one library. Symbols resolved from it dangle afterwards; only teardown calls this.
    fn close_library(&mut self, handle: LibHandle);

    /// Modification time of `path` in seconds since the epoch.
    fn file_mtime(&self, path: &str) -> Option<i64>;

    /// Recursively collect every plugin binary (`.so` on unix, `.dll` on Windows) under `dir`.
    fn find_binaries_under(&self, dir: &Path, out: &mut Vec<PathBuf>);

    /// The on-disk path of the library this code is running from, used to derive the engine's own
    /// rule file at attach time.
    fn current_library_path(&self) -> Option<PathBuf>;
}

/// The real platform, backed by `libloading`. Libraries stay loaded until teardown closes them.
#[derive(Default)]
pub struct SystemPlatform {
    libraries: Vec<Option<libloading::Library>>,
}

impl SystemPlatform {
    pub fn new() -> SystemPlatform {
        SystemPlatform::default()
    }
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        const BINARY_EXTENSION: &str = "dll";
    } else {
        const BINARY_EXTENSION: &str = "so";
    }
}

fn is_plugin_binary(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|extension| extension.eq_ignore_ascii_case(BINARY_EXTENSION))
        .unwrap_or(false)
}

fn scan_directory(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        // A missing or unreadable directory just yields nothing.
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_directory(&path, out);
        } else if is_plugin_binary(&path) {
            out.push(path);
        }
    }
}

impl Platform for SystemPlatform {
    fn open_library(&mut self, path: &str) -> Option<LibHandle> {
        match unsafe { libloading::Library::new(path) } {
            Ok(library) => {
                self.libraries.push(Some(library));
                Some(self.libraries.len() - 1)
            }
            Err(err) => {
                nx_warn!("failed to load library {}: {}", path, err);
                None
            }
        }
    }

    fn resolve_symbol(&mut self, handle: LibHandle, name: &str) -> Option<SymbolAddr> {
        let library = self.libraries.get(handle)?.as_ref()?;
        let mut symbol_name = Vec::with_capacity(name.len() + 1);
        symbol_name.extend_from_slice(name.as_bytes());
        symbol_name.push(0);

        unsafe {
            let symbol: libloading::Symbol<unsafe extern "C" fn()> =
                library.get(&symbol_name).ok()?;
            let address = *symbol as SymbolAddr;
            (!address.is_null()).then_some(address)
        }
    }

    fn close_library(&mut self, handle: LibHandle) {
        if let Some(slot) = self.libraries.get_mut(handle) {
            // Dropping the Library unloads it.
            slot.take();
        }
    }

    fn file_mtime(&self, path: &str) -> Option<i64> {
        let modified = std::fs::metadata(path).ok()?.modified().ok()?;
        match modified.duration_since(UNIX_EPOCH) {
            Ok(duration) => Some(duration.as_secs() as i64),
            // Pre-epoch timestamps count backwards.
            Err(err) => Some(-(err.duration().as_secs() as i64)),
        }
    }

    fn find_binaries_under(&self, dir: &Path, out: &mut Vec<PathBuf>) {
        scan_directory(dir, out);
    }

    fn current_library_path(&self) -> Option<PathBuf> {
        current_library_path_impl()
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn current_library_path_impl() -> Option<PathBuf> {
            use std::ffi::CStr;

            let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
            let address = current_library_path_impl as *const c_void;
            if unsafe { libc::dladdr(address, &mut info) } == 0 || info.dli_fname.is_null() {
                return None;
            }

            let file_name = unsafe { CStr::from_ptr(info.dli_fname) };
            Some(PathBuf::from(file_name.to_string_lossy().into_owned()))
        }
    } else if #[cfg(target_os = "windows")] {
        fn current_library_path_impl() -> Option<PathBuf> {
            use windows::core::PCSTR;
            use windows::Win32::Foundation::HINSTANCE;
            use windows::Win32::System::LibraryLoader::{
                GetModuleFileNameA, GetModuleHandleExA, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
                GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            };

            let mut module = HINSTANCE::default();
            let address = current_library_path_impl as *const c_void;
            let found = unsafe {
                GetModuleHandleExA(
                    GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS
                        | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                    PCSTR(address as *const u8),
                    &mut module,
                )
            };
            if !found.as_bool() {
                return None;
            }

            let mut buffer = [0u8; 4096];
            let length = unsafe { GetModuleFileNameA(module, &mut buffer) } as usize;
            if length == 0 || length >= buffer.len() {
                return None;
            }

            Some(PathBuf::from(
                String::from_utf8_lossy(&buffer[..length]).into_owned(),
            ))
        }
    } else {
        fn current_library_path_impl() -> Option<PathBuf> {
            None
        }
    }
}
