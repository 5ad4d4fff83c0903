//! Giving up root once the capture handle is open.

use std::ffi::CString;

use crate::Error;

/// The account a process switches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// Looks up `user` in the password database.
pub fn lookup(user: &str) -> Result<Account, Error> {
    let name = CString::new(user)?;
    errno::set_errno(errno::Errno(0));
    let pw = unsafe { libc::getpwnam(name.as_ptr()) };
    if pw.is_null() {
        let e = errno::errno();
        return Err(Error::Privilege(if e.0 == 0 {
            format!("{}: no such user", user)
        } else {
            format!("{}: {}", user, e)
        }));
    }
    let pw = unsafe { &*pw };
    Ok(Account {
        name: user.to_string(),
        uid: pw.pw_uid,
        gid: pw.pw_gid,
    })
}

/// Switches the process to `user`: clears supplementary groups, then sets the group and
/// user ids. Doing nothing is not an option, so any failure is an error.
pub fn drop_to(user: &str) -> Result<Account, Error> {
    let account = lookup(user)?;
    let failed = |what: &str| Error::Privilege(format!("{}: {}: {}", user, what, errno::errno()));

    if unsafe { libc::setgroups(0, std::ptr::null()) } != 0 {
        return Err(failed("setgroups"));
    }
    if unsafe { libc::setgid(account.gid) } != 0 {
        return Err(failed("setgid"));
    }
    if unsafe { libc::setuid(account.uid) } != 0 {
        return Err(failed("setuid"));
    }
    tracing::info!(
        "relinquished privileges to {} (uid {}, gid {})",
        account.name,
        account.uid,
        account.gid
    );
    Ok(account)
}
