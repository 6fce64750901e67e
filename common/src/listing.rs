// Copyright (C) 2024 Nicola Dardanis <nicdard@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A directory or a file in a listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Entry {
    /// Extra markup the server renders in front of the name.
    #[serde(default)]
    pub lead: String,
    /// Percent-encoded path segment, relative to the listed directory. Directories end with `/`.
    pub href: String,
    /// Size in bytes.
    #[serde(default)]
    pub sz: u64,
    #[serde(default)]
    pub ext: String,
    /// Last modification, seconds since the epoch.
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub tags: Map<String, Value>,
}

impl Entry {
    /// The decoded display name, without the trailing `/` of directories.
    pub fn name(&self) -> String {
        let trimmed = self.href.trim_end_matches('/');
        String::from_utf8_lossy(&urlencoding::decode_binary(trimmed.as_bytes())).into_owned()
    }
}

/// The answer of an upstream server to `GET <dir>?ls`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DirectoryListing {
    #[serde(default)]
    pub dirs: Vec<Entry>,
    #[serde(default)]
    pub files: Vec<Entry>,
    #[serde(default)]
    pub taglist: Vec<String>,
    #[serde(default)]
    pub srvinf: String,
    /// The account the credential resolved to, `*` for anonymous access.
    #[serde(default)]
    pub acct: String,
    #[serde(default)]
    pub perms: Vec<String>,
    #[serde(default)]
    pub cfg: Map<String, Value>,
    #[serde(default)]
    pub logues: Vec<String>,
    #[serde(default)]
    pub readmes: Vec<String>,
}

impl DirectoryListing {
    pub fn can_read(&self) -> bool {
        self.has_perm("read")
    }

    pub fn can_write(&self) -> bool {
        self.has_perm("write")
    }

    pub fn can_delete(&self) -> bool {
        self.has_perm("delete")
    }

    fn has_perm(&self, perm: &str) -> bool {
        self.perms.iter().any(|p| p == perm)
    }

    /// The account name, if the server reported a named one.
    pub fn account(&self) -> Option<&str> {
        match self.acct.as_str() {
            "" | "*" => None,
            acct => Some(acct),
        }
    }
}
