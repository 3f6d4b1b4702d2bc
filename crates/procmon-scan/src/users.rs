//! uid -> user name cache shared by every process row.

use std::collections::HashMap;
use std::sync::Arc;

/// Resolves a uid to a login name; `None` when the account is unknown.
pub type UserResolver = fn(u32) -> Option<String>;

/// Caches resolved user names so rows owned by the same uid share one
/// allocation.
#[derive(Debug)]
pub struct UsersTable {
    names: HashMap<u32, Arc<str>>,
    resolver: UserResolver,
}

impl UsersTable {
    /// Table backed by the system password database.
    pub fn new() -> Self {
        Self::with_resolver(lookup_username)
    }

    pub fn with_resolver(resolver: UserResolver) -> Self {
        UsersTable {
            names: HashMap::new(),
            resolver,
        }
    }

    /// Shared name for `uid`, resolving and caching on first use.
    ///
    /// Unknown uids resolve to their decimal form.
    pub fn get_ref(&mut self, uid: u32) -> Arc<str> {
        let resolver = self.resolver;
        self.names
            .entry(uid)
            .or_insert_with(|| match resolver(uid) {
                Some(name) => Arc::from(name),
                None => Arc::from(uid.to_string()),
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for UsersTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Look up the login name for `uid` via `getpwuid_r`.
#[cfg(unix)]
pub fn lookup_username(uid: u32) -> Option<String> {
    use std::ffi::CStr;

    let mut buf_size = 1024usize;
    let max_buf_size = 65536usize;

    loop {
        let mut buf: Vec<u8> = vec![0; buf_size];
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        let ret = unsafe {
            libc::getpwuid_r(
                uid,
                &mut pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf_size,
                &mut result,
            )
        };

        if ret == libc::ERANGE && buf_size < max_buf_size {
            buf_size *= 2;
            continue;
        }

        if ret != 0 || result.is_null() || pwd.pw_name.is_null() {
            return None;
        }

        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return Some(name.to_string_lossy().into_owned());
    }
}

#[cfg(not(unix))]
pub fn lookup_username(_uid: u32) -> Option<String> {
    None
}
