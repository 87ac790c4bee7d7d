//! Shared fixtures for sitebundle integration tests

#![allow(dead_code)]

use sitebundle::{Bundle, BinaryWrite, MemoryKeyStore, SiteIdentity, SiteTree};
use std::ops::Range;

pub const SITE: &str = "news.freedom";

pub fn site() -> SiteIdentity {
    SiteIdentity::new(SITE).expect("valid identity")
}

/// Key store holding one freshly generated key for `identity`
pub fn keys_for(identity: &SiteIdentity) -> MemoryKeyStore {
    let keys = MemoryKeyStore::new();
    keys.generate(identity).expect("generate key");
    keys
}

/// A small site covering nested paths, binary data and an empty file
pub fn sample_tree() -> SiteTree {
    let mut tree = SiteTree::new();
    tree.insert("index.html", "<html><body>Hello Freedom</body></html>")
        .unwrap();
    tree.insert("about/index.html", "<p>About us</p>").unwrap();
    tree.insert("css/site.css", "body { font-family: serif }")
        .unwrap();
    tree.insert("img/logo.png", vec![0x89, b'P', b'N', b'G', 0, 0xFF, 0x10])
        .unwrap();
    tree.insert("robots.txt", Vec::new()).unwrap();
    tree
}

/// Site with `count` small distinct files
pub fn generated_tree(count: usize) -> SiteTree {
    let mut tree = SiteTree::new();
    for i in 0..count {
        tree.insert(&format!("pages/{:05}.html", i), format!("<p>page {}</p>", i))
            .unwrap();
    }
    tree
}

/// Byte ranges of one encoded record
#[derive(Debug, Clone)]
pub struct RecordLayout {
    pub entry_index: u32,
    pub nonce: Range<usize>,
    pub tag: Range<usize>,
    pub ciphertext: Range<usize>,
}

/// Locate every record (manifest first) inside the encoded `bundle`
pub fn record_layouts(bundle: &Bundle) -> Vec<RecordLayout> {
    let mut offset = bundle.header.serialized_size();
    let mut layouts = Vec::with_capacity(bundle.entries.len() + 1);
    let mut push = |offset: &mut usize, index: u32, len: usize| {
        let start = *offset + 4;
        layouts.push(RecordLayout {
            entry_index: index,
            nonce: start..start + 12,
            tag: start + 12..start + 28,
            ciphertext: start + 32..start + 32 + len,
        });
        *offset = start + 32 + len;
    };

    push(&mut offset, bundle.manifest.entry_index, bundle.manifest.ciphertext.len());
    // entry_count
    offset += 4;
    for record in &bundle.entries {
        push(&mut offset, record.entry_index, record.ciphertext.len());
    }
    layouts
}
