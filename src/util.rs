//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    fs,
    path::Path,
};
use anyhow::{Result, Context};

pub const KB: usize = 1024;
pub const MB: usize = 1024*1024;

pub fn create_dir_all(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))
}

/// Returns the offset of the first occurrence of `needle` in `haystack`.
/// The HTTP framer and the multipart parser both scan raw body bytes, which
/// are not necessarily valid UTF-8, so the search works on byte slices.
pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Extension of a filename including the leading dot (e.g., ".jpg"), if any.
pub fn file_extension(filename: &str) -> Option<&str> {
    filename.rfind('.').map(|pos| &filename[pos..])
}
