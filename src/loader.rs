//! Dynamic library loading for callable native addresses.
//!
//! The ABI adaptor can emit calls to any resolved address; which
//! libraries to open and when is the embedding runtime's policy, not
//! this crate's.

use std::ffi::c_void;

use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: libloading::Error,
    },
    #[error("symbol {name} not found: {source}")]
    Symbol {
        name: String,
        source: libloading::Error,
    },
}

/// An open shared object whose symbols can be called from generated code.
///
/// The library stays mapped for the lifetime of this value; callers must
/// keep it alive as long as emitted code holds resolved addresses.
#[derive(Debug)]
pub struct NativeLibrary {
    lib: libloading::Library,
    path: String,
}

impl NativeLibrary {
    pub fn open(path: &str) -> Result<Self, LoaderError> {
        let lib = unsafe { libloading::Library::new(path) }.map_err(|source| LoaderError::Open {
            path: path.to_string(),
            source,
        })?;
        debug!("opened {path}");
        Ok(Self {
            lib,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resolve a symbol to a callable address.
    pub fn symbol(&self, name: &str) -> Result<*const c_void, LoaderError> {
        let sym = unsafe { self.lib.get::<*const c_void>(name.as_bytes()) }.map_err(|source| {
            LoaderError::Symbol {
                name: name.to_string(),
                source,
            }
        })?;
        let addr: *const c_void = *sym;
        debug!("resolved {name} in {} at {addr:p}", self.path);
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_reports_path() {
        let err = NativeLibrary::open("/nonexistent/libdoesnotexist.so").unwrap_err();
        assert!(err.to_string().contains("libdoesnotexist"));
    }
}
