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

//! Types shared between the proxy service and its clients.

pub mod crypto;
pub mod listing;
pub mod storage;
pub mod upload;

/// Name of the http-only cookie carrying the encrypted credential.
pub const AUTH_COOKIE_NAME: &str = "copyparty_auth";

pub use crypto::CredentialCipher;
pub use listing::{DirectoryListing, Entry};
pub use storage::{FileStore, KeyValueStore, MemoryStore, ServerPreference, StorageError};
pub use upload::{UploadStatus, UploadTask};
