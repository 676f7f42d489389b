//! Kernel command line parsing utilities.
//!
//! The booted deployment is identified by the `ostree=` argument, and
//! each boot entry's `options` line is a kernel command line too.

use std::borrow::Cow;

use anyhow::Result;

/// The kernel argument pointing at the deployment to boot.
pub const OSTREE_KARG: &str = "ostree";

/// A parsed kernel command line.
///
/// Wraps the raw command line bytes; the booted one may not be UTF-8.
#[derive(Debug)]
pub struct Cmdline<'a>(Cow<'a, [u8]>);

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Cmdline<'a> {
    fn from(input: &'a T) -> Self {
        Self(Cow::Borrowed(input.as_ref()))
    }
}

impl<'a> Cmdline<'a> {
    /// Reads the kernel command line from `/proc/cmdline`.
    pub fn from_proc() -> Result<Self> {
        Ok(Self(Cow::Owned(std::fs::read("/proc/cmdline")?)))
    }

    /// Iterate over parameters, splitting on whitespace outside of quotes.
    pub fn iter(&'a self) -> impl Iterator<Item = Parameter<'a>> + 'a {
        let mut in_quotes = false;

        self.0
            .split(move |c| {
                if *c == b'"' {
                    in_quotes = !in_quotes;
                }
                !in_quotes && c.is_ascii_whitespace()
            })
            .filter(|p| !p.is_empty())
            .map(Parameter::from)
    }

    /// Locate the UTF-8 value of the first argument with this key.
    ///
    /// Key comparison treats dashes and underscores as equivalent.
    pub fn value_of_utf8(&'a self, key: &str) -> Option<&'a str> {
        self.iter()
            .find(|p| keys_equal(p.key, key.as_bytes()))
            .and_then(|p| p.value)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Render all arguments except those with the given key.
    pub fn without_key(&'a self, key: &str) -> String {
        self.iter()
            .filter(|p| !keys_equal(p.key, key.as_bytes()))
            .map(|p| String::from_utf8_lossy(p.parameter))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn keys_equal(a: &[u8], b: &[u8]) -> bool {
    let dedashed = |&c: &u8| if c == b'-' { b'_' } else { c };
    // We can't just zip() because leading substrings would match
    a.iter().map(dedashed).eq(b.iter().map(dedashed))
}

/// A single kernel command line parameter.
#[derive(Debug, PartialEq, Eq)]
pub struct Parameter<'a> {
    /// The full original text of the parameter
    pub parameter: &'a [u8],
    /// The key
    pub key: &'a [u8],
    /// The value with its outermost quotes removed, if present
    pub value: Option<&'a [u8]>,
}

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Parameter<'a> {
    fn from(input: &'a T) -> Self {
        let input = input.as_ref();
        match input.iter().position(|b| *b == b'=') {
            None => Self {
                parameter: input,
                key: input,
                value: None,
            },
            Some(i) => {
                let (key, value) = input.split_at(i);
                // skip `=`, we know it's the first byte
                let value = &value[1..];
                // *Only* the first and last double quotes are stripped
                let value = value
                    .strip_prefix(b"\"")
                    .unwrap_or(value)
                    .strip_suffix(b"\"")
                    .unwrap_or(value);
                Self {
                    parameter: input,
                    key,
                    value: Some(value),
                }
            }
        }
    }
}
