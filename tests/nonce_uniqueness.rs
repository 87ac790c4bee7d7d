mod common;

use common::{generated_tree, keys_for, site};
use sitebundle::{Bundle, Packager, Verifier};
use std::collections::HashSet;
use std::thread;

fn collect_nonces(bundle: &Bundle, seen: &mut HashSet<[u8; 12]>) -> usize {
    let mut collisions = 0;
    for record in std::iter::once(&bundle.manifest).chain(&bundle.entries) {
        if !seen.insert(record.nonce) {
            collisions += 1;
        }
    }
    collisions
}

#[test]
fn test_ten_thousand_entries_never_share_a_nonce() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let keys = keys_for(&site);
    let tree = generated_tree(10_000);

    let bundle = Packager::new(&keys).parallelism(8).seal(&tree, &site)?;
    let mut seen = HashSet::new();
    assert_eq!(collect_nonces(&bundle, &mut seen), 0);
    assert_eq!(seen.len(), 10_001);

    let opened = Verifier::new(&keys).parallelism(8).open(&bundle.to_bytes()?)?;
    assert_eq!(opened.len(), 10_000);
    Ok(())
}

#[test]
fn test_concurrent_seals_share_one_sequence() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let keys = keys_for(&site);
    let tree = generated_tree(2_500);
    // One packager, one nonce sequence, four threads sealing at once
    let packager = Packager::new(&keys).parallelism(2);

    let bundles = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| packager.seal(&tree, &site)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("sealing thread panicked"))
            .collect::<Result<Vec<_>, _>>()
    })?;

    let mut seen = HashSet::new();
    let collisions: usize = bundles
        .iter()
        .map(|bundle| collect_nonces(bundle, &mut seen))
        .sum();
    assert_eq!(collisions, 0);
    assert_eq!(seen.len(), 4 * 2_501);
    Ok(())
}
