//! Open-document bookmarks, kept in the order the files were opened.

use std::path::Path;

/// Which neighbour [`TabList::adjacent`] picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

/// A bookmark for one open document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tab {
    pub file_path: String,
    /// Last path component of `file_path`.
    pub file_name: String,
    /// Last known cursor line.
    pub line: usize,
    /// Last known cursor column.
    pub ch: usize,
}

impl Tab {
    pub fn new(file_path: impl Into<String>) -> Self {
        let file_path = file_path.into();
        Self {
            file_name: file_name_of(&file_path),
            file_path,
            line: 0,
            ch: 0,
        }
    }
}

fn file_name_of(file_path: &str) -> String {
    Path::new(file_path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.to_string())
}

/// Ordered tabs; never two with the same `file_path`.
#[derive(Debug, Clone, Default)]
pub struct TabList {
    tabs: Vec<Tab>,
}

impl TabList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tab for `file_path` unless one exists. Returns its index.
    pub fn open(&mut self, file_path: &str) -> usize {
        if let Some(index) = self.position(file_path) {
            return index;
        }
        self.tabs.push(Tab::new(file_path));
        self.tabs.len() - 1
    }

    pub fn remove(&mut self, file_path: &str) -> Option<Tab> {
        let index = self.position(file_path)?;
        Some(self.tabs.remove(index))
    }

    /// The tab next to `file_path`, wrapping at either end.
    ///
    /// `None` when `file_path` is not open or is the only tab.
    pub fn adjacent(&self, file_path: &str, direction: Direction) -> Option<&Tab> {
        let index = self.position(file_path)?;
        let count = self.tabs.len();
        if count < 2 {
            return None;
        }
        let next = match direction {
            Direction::Next => (index + 1) % count,
            Direction::Previous => (index + count - 1) % count,
        };
        self.tabs.get(next)
    }

    /// Point the tab at `old_path` to a sibling file called `new_name`.
    ///
    /// Returns the new path, or `None` if no tab has `old_path` or another
    /// tab already has the new path.
    pub fn rename(&mut self, old_path: &str, new_name: &str) -> Option<String> {
        let index = self.position(old_path)?;
        let new_path = match Path::new(old_path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                parent.join(new_name).to_string_lossy().into_owned()
            }
            _ => new_name.to_string(),
        };
        if new_path != old_path && self.contains(&new_path) {
            return None;
        }

        let tab = &mut self.tabs[index];
        tab.file_name = file_name_of(&new_path);
        tab.file_path = new_path.clone();
        Some(new_path)
    }

    /// Remember the cursor position for a tab.
    pub fn update_position(&mut self, file_path: &str, line: usize, ch: usize) -> bool {
        match self.tabs.iter_mut().find(|t| t.file_path == file_path) {
            Some(tab) => {
                tab.line = line;
                tab.ch = ch;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, file_path: &str) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.file_path == file_path)
    }

    pub fn contains(&self, file_path: &str) -> bool {
        self.position(file_path).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tab> {
        self.tabs.iter()
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    fn position(&self, file_path: &str) -> Option<usize> {
        self.tabs.iter().position(|t| t.file_path == file_path)
    }
}
