//! Wire protocol table
//!
//! A request is a sequence of frames, each a little-endian `u32` tag followed
//! by the payload listed below. Strings are a `u32` byte length followed by
//! that many bytes, without a terminator.
//!
//! | Tag          | Payload                                   | Notes                      |
//! |--------------|-------------------------------------------|----------------------------|
//! | `Options`    | `u32` flag bits                           | at most once               |
//! | `AppName`    | string                                    | at most once               |
//! | `Exec`       | string                                    | at most once, required     |
//! | `Args`       | `u32` count, then `count` strings         | at most once               |
//! | `Env`        | `u32` count, then `count` strings         | at most once               |
//! | `Io`         | three `i32` slot numbers + `SCM_RIGHTS`   | at most once               |
//! | `Ids`        | `u32` uid, `u32` gid                      | at most once, required     |
//! | `Priority`   | `i32`                                     | at most once               |
//! | `Delay`      | `u32` seconds                             | at most once               |
//! | `End`        | none                                      | terminates the request     |
//!
//! Field order is chosen by the sender. The daemon answers with `Pid` and,
//! unless the request was detached, `ExitStatus` once the child is gone.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Tag {
    Options = 0xb007_0000,
    AppName = 0x5a5e_0000,
    Exec = 0xe8ec_0000,
    Args = 0xa465_0000,
    Env = 0xe571_0000,
    Io = 0x10fd_0000,
    Ids = 0xb2df_4000,
    Priority = 0xa1ce_0000,
    Delay = 0xb2de_0000,
    End = 0xdead_0000,
    Pid = 0x1d1d_0000,
    ExitStatus = 0xe417_0000,
}

impl Tag {
    /// Tags an invoker may send as part of a request, `End` excluded
    pub const REQUEST_FIELDS: [Tag; 9] = [
        Tag::Options,
        Tag::AppName,
        Tag::Exec,
        Tag::Args,
        Tag::Env,
        Tag::Io,
        Tag::Ids,
        Tag::Priority,
        Tag::Delay,
    ];

    pub const fn value(self) -> u32 {
        self as u32
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        let tag = match raw {
            0xb007_0000 => Tag::Options,
            0x5a5e_0000 => Tag::AppName,
            0xe8ec_0000 => Tag::Exec,
            0xa465_0000 => Tag::Args,
            0xe571_0000 => Tag::Env,
            0x10fd_0000 => Tag::Io,
            0xb2df_4000 => Tag::Ids,
            0xa1ce_0000 => Tag::Priority,
            0xb2de_0000 => Tag::Delay,
            0xdead_0000 => Tag::End,
            0x1d1d_0000 => Tag::Pid,
            0xe417_0000 => Tag::ExitStatus,
            _ => return None,
        };
        Some(tag)
    }

    /// Index into `REQUEST_FIELDS`, used to track which fields were seen
    pub fn field_index(self) -> Option<usize> {
        Self::REQUEST_FIELDS.iter().position(|t| *t == self)
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::Options => "OPTIONS",
            Tag::AppName => "APPNAME",
            Tag::Exec => "EXEC",
            Tag::Args => "ARGS",
            Tag::Env => "ENV",
            Tag::Io => "IO",
            Tag::Ids => "IDS",
            Tag::Priority => "PRIORITY",
            Tag::Delay => "DELAY",
            Tag::End => "END",
            Tag::Pid => "PID",
            Tag::ExitStatus => "EXITSTATUS",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Bits carried by the `Options` frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptionFlags: u32 {
        /// Fire-and-forget: the invoker will not wait for an exit status
        const DETACH = 0x0000_0001;
    }
}

/// Upper bounds checked before any allocation driven by peer input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolLimits {
    /// Maximum declared `Args` count
    pub max_args: u32,
    /// Maximum declared `Env` count
    pub max_env: u32,
    /// Maximum length of a single string, in bytes
    pub max_string_len: u32,
    /// Maximum string bytes across a whole request
    pub max_request_bytes: u32,
}

impl ProtocolLimits {
    pub const DEFAULT_MAX_ARGS: u32 = 1024;
    pub const DEFAULT_MAX_ENV: u32 = 4096;
    pub const DEFAULT_MAX_STRING_LEN: u32 = 128 * 1024;
    /// Matches the usual exec argument space; exec rejects more anyway
    pub const DEFAULT_MAX_REQUEST_BYTES: u32 = 2 * 1024 * 1024;
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            max_args: Self::DEFAULT_MAX_ARGS,
            max_env: Self::DEFAULT_MAX_ENV,
            max_string_len: Self::DEFAULT_MAX_STRING_LEN,
            max_request_bytes: Self::DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_distinct_and_resolve() {
        let all = [
            Tag::Options,
            Tag::AppName,
            Tag::Exec,
            Tag::Args,
            Tag::Env,
            Tag::Io,
            Tag::Ids,
            Tag::Priority,
            Tag::Delay,
            Tag::End,
            Tag::Pid,
            Tag::ExitStatus,
        ];

        for (i, a) in all.iter().enumerate() {
            assert_eq!(Tag::from_u32(a.value()), Some(*a));
            for b in &all[i + 1..] {
                assert_ne!(a.value(), b.value());
            }
        }
    }

    #[test]
    fn unknown_tag_does_not_resolve() {
        assert_eq!(Tag::from_u32(0), None);
        assert_eq!(Tag::from_u32(0xffff_ffff), None);
    }

    #[test]
    fn only_request_fields_have_an_index() {
        assert_eq!(Tag::Options.field_index(), Some(0));
        assert_eq!(Tag::Delay.field_index(), Some(8));
        assert_eq!(Tag::End.field_index(), None);
        assert_eq!(Tag::Pid.field_index(), None);
    }

    #[test]
    fn limits_fill_missing_fields_with_defaults() {
        let limits: ProtocolLimits = toml::from_str("max_args = 16").unwrap();
        assert_eq!(limits.max_args, 16);
        assert_eq!(limits.max_env, ProtocolLimits::DEFAULT_MAX_ENV);
        assert_eq!(limits.max_string_len, ProtocolLimits::DEFAULT_MAX_STRING_LEN);
        assert_eq!(limits.max_request_bytes, ProtocolLimits::DEFAULT_MAX_REQUEST_BYTES);
    }

    #[test]
    fn detach_flag_round_trips_through_bits() {
        let flags = OptionFlags::from_bits(OptionFlags::DETACH.bits()).unwrap();
        assert!(flags.contains(OptionFlags::DETACH));
        assert!(OptionFlags::from_bits(0x8000_0000).is_none());
    }
}
