//! Member file names for the family driver.
//!
//! A template is a file name with exactly one integer conversion, for
//! example `data-%06d.h5`. `%%` stands for a literal percent sign.

use std::fmt;

use crate::error::{Result, VfdError};

/// Conversion inserted into plain names.
const DEFAULT_CONVERSION: &str = "-%06d";

/// A parsed member-name template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberTemplate {
    raw: String,
    prefix: String,
    suffix: String,
    zero_pad: bool,
    width: usize,
}

impl MemberTemplate {
    /// Parse `text`. Returns `Ok(None)` for a plain name with no
    /// conversion, and `BadArg` for a malformed template or one with more
    /// than one conversion.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let bad = |why: &str| VfdError::BadArg(format!("member template '{text}': {why}"));

        let mut prefix = String::new();
        let mut suffix = String::new();
        let mut conversion: Option<(bool, usize)> = None;
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            let out = if conversion.is_some() { &mut suffix } else { &mut prefix };
            if c != '%' {
                out.push(c);
                continue;
            }
            if chars.peek() == Some(&'%') {
                chars.next();
                out.push('%');
                continue;
            }
            if conversion.is_some() {
                return Err(bad("more than one conversion"));
            }
            let zero_pad = chars.next_if_eq(&'0').is_some();
            let mut width = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                chars.next();
                width = width
                    .checked_mul(10)
                    .and_then(|w| w.checked_add(d as usize))
                    .ok_or_else(|| bad("field width too large"))?;
            }
            match chars.next() {
                Some('d' | 'i' | 'u') => conversion = Some((zero_pad, width)),
                Some(other) => return Err(bad(&format!("unsupported conversion '%{other}'"))),
                None => return Err(bad("dangling '%'")),
            }
        }

        Ok(conversion.map(|(zero_pad, width)| Self {
            raw: text.to_owned(),
            prefix,
            suffix,
            zero_pad,
            width,
        }))
    }

    /// Template for a plain path: `-%06d` before the last extension of the
    /// final component, or at the end when there is none.
    pub fn default_for(path: &str) -> String {
        let escaped = path.replace('%', "%%");
        let file_start = escaped
            .rfind(|c: char| c == '/' || c == std::path::MAIN_SEPARATOR)
            .map_or(0, |i| i + 1);
        match escaped[file_start..].rfind('.') {
            Some(dot) if dot > 0 => {
                let at = file_start + dot;
                format!("{}{DEFAULT_CONVERSION}{}", &escaped[..at], &escaped[at..])
            }
            _ => format!("{escaped}{DEFAULT_CONVERSION}"),
        }
    }

    /// The file name of member `index`.
    pub fn expand(&self, index: usize) -> String {
        let width = self.width;
        let number = if self.zero_pad {
            format!("{index:0width$}")
        } else {
            format!("{index:width$}")
        };
        format!("{}{number}{}", self.prefix, self.suffix)
    }

    /// The template as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for MemberTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
