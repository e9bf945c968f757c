//! Remote cursors: who is looking at which line of which file.
//!
//! ## Data flow
//!
//! ```text
//! cursor-move-broadcast
//!       │
//!       ▼
//! CursorBoard::handle_broadcast()    one entry per (username, file)
//!       │
//!       ▼
//! CursorBoard::cursors_in(path)      editor draws them with Cursor::color
//! ```
//!
//! Cursors are transient: nothing here is persisted, and every broadcast
//! replaces the previous entry for that user and file.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use teamcode_core::PieceId;

use crate::protocol::{CursorListEntry, CursorMoveBroadcast};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    const SATURATION: f32 = 0.9;
    const LIGHTNESS: f32 = 0.5;

    /// Stable color for a username.
    pub fn from_username(username: &str) -> Self {
        let hue = username_hue(username);
        let (r, g, b) = hsl_to_rgb(hue as f32 / 360.0, Self::SATURATION, Self::LIGHTNESS);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb`, for editors that style cursors with CSS colors.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

const HUES: usize = 360;

/// Pearson-style hash of a username into a hue in `[0, 360)`.
///
/// Digits and underscores are skipped so `anna_2` and `anna` share a hue.
/// The permutation `i * 169 mod 360` visits every hue once since 169 and
/// 360 are coprime.
pub fn username_hue(username: &str) -> u32 {
    let permutation = |i: usize| (i * 169 % HUES) as u32;
    let modulus = HUES - 1;

    let seed = username.encode_utf16().count() % modulus;
    username
        .chars()
        .filter(|c| !c.is_ascii_digit() && *c != '_')
        .collect::<String>()
        .encode_utf16()
        .fold(permutation(seed), |hash, unit| {
            permutation((hash as usize + unit as usize) % modulus)
        })
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Cursors
// ───────────────────────────────────────────────────────────────────

/// A remote user's cursor in one file.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub username: String,
    pub file_path: String,
    pub piece_id: PieceId,
    /// Line index within the piece.
    pub line: usize,
    /// Character index within the line.
    pub ch: usize,
    pub color: CursorColor,
}

impl From<&CursorMoveBroadcast> for Cursor {
    fn from(msg: &CursorMoveBroadcast) -> Self {
        Self {
            username: msg.username.clone(),
            file_path: msg.file_path.clone(),
            piece_id: msg.piece_id.clone(),
            line: msg.offset,
            ch: msg.column,
            color: CursorColor::from_username(&msg.username),
        }
    }
}

/// Remote cursors keyed by `(username, file_path)`.
#[derive(Debug, Clone, Default)]
pub struct CursorBoard {
    local_username: String,
    cursors: HashMap<(String, String), Cursor>,
}

impl CursorBoard {
    pub fn new(local_username: impl Into<String>) -> Self {
        Self {
            local_username: local_username.into(),
            cursors: HashMap::new(),
        }
    }

    /// Record a remote cursor move. Returns `false` for our own cursor.
    pub fn handle_broadcast(&mut self, msg: &CursorMoveBroadcast) -> bool {
        if msg.username == self.local_username {
            return false;
        }
        let cursor = Cursor::from(msg);
        self.cursors
            .insert((cursor.username.clone(), cursor.file_path.clone()), cursor);
        true
    }

    /// Replace every cursor in `file_path` with a full listing from the
    /// server. Our own entry is skipped.
    pub fn replace_file(&mut self, file_path: &str, listing: &[CursorListEntry]) {
        self.clear_file(file_path);
        for entry in listing {
            if entry.username == self.local_username {
                continue;
            }
            let cursor = Cursor {
                username: entry.username.clone(),
                file_path: file_path.to_string(),
                piece_id: entry.piece_id.clone(),
                line: entry.offset,
                ch: entry.column,
                color: CursorColor::from_username(&entry.username),
            };
            self.cursors
                .insert((cursor.username.clone(), cursor.file_path.clone()), cursor);
        }
    }

    /// Forget one user's cursor in one file.
    pub fn remove(&mut self, username: &str, file_path: &str) -> Option<Cursor> {
        self.cursors
            .remove(&(username.to_string(), file_path.to_string()))
    }

    /// Forget every cursor in a file.
    pub fn clear_file(&mut self, file_path: &str) {
        self.cursors.retain(|(_, path), _| path != file_path);
    }

    /// Rewrite cursors after a file was renamed.
    pub fn rename_file(&mut self, old_path: &str, new_path: &str) {
        let keys: Vec<(String, String)> = self
            .cursors
            .keys()
            .filter(|(_, path)| path == old_path)
            .cloned()
            .collect();
        for key in keys {
            let Some(mut cursor) = self.cursors.remove(&key) else {
                continue;
            };
            cursor.file_path = new_path.to_string();
            self.cursors
                .insert((cursor.username.clone(), cursor.file_path.clone()), cursor);
        }
    }

    /// Cursors in one file, sorted by username.
    pub fn cursors_in(&self, file_path: &str) -> Vec<&Cursor> {
        let mut cursors: Vec<&Cursor> = self
            .cursors
            .values()
            .filter(|c| c.file_path == file_path)
            .collect();
        cursors.sort_by(|a, b| a.username.cmp(&b.username));
        cursors
    }

    pub fn get(&self, username: &str, file_path: &str) -> Option<&Cursor> {
        self.cursors
            .get(&(username.to_string(), file_path.to_string()))
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn local_username(&self) -> &str {
        &self.local_username
    }

    /// Adopt the name the server assigned. A cursor already recorded
    /// under that name is ours and is dropped.
    pub fn set_local_username(&mut self, username: impl Into<String>) {
        self.local_username = username.into();
        let local = self.local_username.clone();
        self.cursors.retain(|(name, _), _| *name != local);
    }
}
