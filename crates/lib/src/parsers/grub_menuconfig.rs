//! Parser and renderer for GRUB menuentry configuration using nom combinators.

use std::borrow::Cow;
use std::fmt::Display;

use nom::{
    bytes::complete::{escaped, tag, take_until},
    character::complete::{anychar, char, multispace0, multispace1, none_of},
    combinator::cut,
    error::{Error, ErrorKind, ParseError},
    multi::many0,
    sequence::{delimited, preceded},
    Err, IResult, Parser,
};

use crate::deployment::Deployment;

/// Body content of a GRUB menuentry containing parsed commands.
#[derive(Debug, PartialEq, Eq)]
pub struct MenuentryBody<'a> {
    /// Modules to load
    pub insmod: Vec<&'a str>,
    /// The `linux` command: kernel path followed by its arguments
    pub linux: Cow<'a, str>,
    /// The `initrd` command argument
    pub initrd: Cow<'a, str>,
    /// Additional commands
    pub extra: Vec<(&'a str, &'a str)>,
}

impl<'a> Display for MenuentryBody<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for insmod in &self.insmod {
            writeln!(f, "insmod {}", insmod)?;
        }

        for (k, v) in &self.extra {
            writeln!(f, "{k} {v}")?;
        }

        writeln!(f, "linux {}", self.linux)?;
        if !self.initrd.is_empty() {
            writeln!(f, "initrd {}", self.initrd)?;
        }

        Ok(())
    }
}

impl<'a> From<Vec<(&'a str, &'a str)>> for MenuentryBody<'a> {
    fn from(vec: Vec<(&'a str, &'a str)>) -> Self {
        let mut entry = Self {
            insmod: vec![],
            linux: "".into(),
            initrd: "".into(),
            extra: vec![],
        };

        for (key, value) in vec {
            match key {
                "insmod" => entry.insmod.push(value),
                "linux" | "linux16" | "linuxefi" => entry.linux = value.into(),
                "initrd" | "initrd16" | "initrdefi" => entry.initrd = value.into(),
                _ => entry.extra.push((key, value)),
            }
        }

        entry
    }
}

/// A complete GRUB menuentry with title and body commands.
#[derive(Debug, PartialEq, Eq)]
pub struct MenuEntry<'a> {
    /// Display title (supports escaped quotes)
    pub title: String,
    /// Commands within the menuentry block
    pub body: MenuentryBody<'a>,
}

impl<'a> Display for MenuEntry<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let title = self.title.replace('\\', "\\\\").replace('"', "\\\"");
        writeln!(f, "menuentry \"{title}\" {{")?;
        write!(f, "{}", self.body)?;
        writeln!(f, "}}")
    }
}

impl MenuEntry<'static> {
    /// Build the menuentry booting a deployment.
    pub fn for_deployment(deployment: &Deployment) -> Self {
        let config = &deployment.bootconfig;
        let title = config
            .title
            .clone()
            .unwrap_or_else(|| deployment.to_string());
        let linux = match config.options.as_deref() {
            Some(options) => format!("{} {options}", config.linux),
            None => config.linux.clone(),
        };
        Self {
            title,
            body: MenuentryBody {
                insmod: vec!["gzio", "part_gpt", "ext2"],
                linux: linux.into(),
                initrd: config.initrd.join(" ").into(),
                extra: vec![],
            },
        }
    }
}

/// The text up to the `}` closing a block whose `{` was already consumed.
/// Nested blocks and backslash escapes are skipped over.
fn block_body(input: &str) -> IResult<&str, &str> {
    let mut depth = 0usize;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '{' => depth += 1,
            '}' if depth == 0 => return Ok((&input[i..], &input[..i])),
            '}' => depth -= 1,
            _ => {}
        }
    }
    Err(Err::Error(Error::from_error_kind(input, ErrorKind::TakeUntil)))
}

/// A double-quoted title, unescaped.
fn quoted_title(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        escaped(none_of("\\\""), '\\', anychar),
        char('"'),
    )
    .map(|t: &str| t.replace("\\\"", "\"").replace("\\\\", "\\"))
    .parse(input)
}

/// `key value` pairs of a block body; comments and bare words are skipped.
fn body_commands(body: &str) -> Vec<(&str, &str)> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once(char::is_whitespace))
        .map(|(key, value)| (key, value.trim()))
        .collect()
}

fn menuentry(input: &str) -> IResult<&str, MenuEntry<'_>> {
    let (input, (title, body)) = (
        preceded((tag("menuentry"), multispace1), quoted_title),
        preceded(multispace0, delimited(char('{'), block_body, char('}'))),
    )
        .parse(input)?;
    let body = MenuentryBody::from(body_commands(body));
    Ok((input, MenuEntry { title, body }))
}

/// Every menuentry in a configuration file. Anything between entries is
/// ignored, but an entry that fails to parse fails the whole file.
fn menuentries(input: &str) -> IResult<&str, Vec<MenuEntry<'_>>> {
    many0(preceded(take_until("menuentry"), cut(menuentry))).parse(input)
}

/// Parse every menuentry from the text of a GRUB configuration file.
pub fn parse_grub_menuentry_file(contents: &str) -> anyhow::Result<Vec<MenuEntry<'_>>> {
    let (_, entries) = menuentries(contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse GRUB menuentries: {e}"))?;
    for entry in &entries {
        if entry.title.is_empty() {
            anyhow::bail!("Found menuentry with empty title");
        }
        if entry.body.linux.is_empty() {
            anyhow::bail!("menuentry {:?} has no linux command", entry.title);
        }
    }

    Ok(entries)
}
