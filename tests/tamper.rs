mod common;

use common::{keys_for, record_layouts, sample_tree, site};
use sitebundle::{BundleError, Packager, Verifier};

fn flip(bytes: &[u8], bit: usize) -> Vec<u8> {
    let mut tampered = bytes.to_vec();
    tampered[bit / 8] ^= 1 << (bit % 8);
    tampered
}

#[test]
fn test_every_sealed_bit_is_authenticated() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let keys = keys_for(&site);
    let bundle = Packager::new(&keys).seal(&sample_tree(), &site)?;
    let bytes = bundle.to_bytes()?;
    let verifier = Verifier::new(&keys);

    let mut checked = 0;
    for layout in record_layouts(&bundle) {
        for range in [&layout.nonce, &layout.tag, &layout.ciphertext] {
            for bit in range.start * 8..range.end * 8 {
                match verifier.open(&flip(&bytes, bit)) {
                    Err(BundleError::TamperDetected(_)) => checked += 1,
                    other => panic!(
                        "bit {} of record {} gave {:?}",
                        bit,
                        layout.entry_index,
                        other.map(|tree| tree.len())
                    ),
                }
            }
        }
    }
    // 28 bytes of nonce and tag per record, plus every ciphertext byte
    let expected: usize = record_layouts(&bundle)
        .iter()
        .map(|l| (28 + l.ciphertext.len()) * 8)
        .sum();
    assert_eq!(checked, expected);
    Ok(())
}

#[test]
fn test_no_single_bit_flip_opens() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let keys = keys_for(&site);
    let bytes = Packager::new(&keys).seal_to_bytes(&sample_tree(), &site)?;
    let verifier = Verifier::new(&keys);

    // Header, length prefixes and indices included: every flip is rejected
    for bit in 0..bytes.len() * 8 {
        assert!(
            verifier.open(&flip(&bytes, bit)).is_err(),
            "bit {} flipped and the bundle still opened",
            bit
        );
    }
    Ok(())
}

#[test]
fn test_record_substitution_between_bundles() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let keys = keys_for(&site);
    let packager = Packager::new(&keys);
    let original = packager.seal(&sample_tree(), &site)?;

    let mut changed_tree = sample_tree();
    changed_tree.insert("extra.html", "<p>injected</p>")?;
    let other = packager.seal(&changed_tree, &site)?;

    // Same key, same site: splice a record from another bundle in
    let mut spliced = original.clone();
    spliced.entries[0] = other.entries[0].clone();
    let err = Verifier::new(&keys).open(&spliced.to_bytes()?).unwrap_err();
    assert!(matches!(err, BundleError::TamperDetected(_)), "{:?}", err);

    // Or swap the whole manifest
    let mut spliced = original;
    spliced.manifest = other.manifest;
    let err = Verifier::new(&keys).open(&spliced.to_bytes()?).unwrap_err();
    assert!(matches!(err, BundleError::TamperDetected(_)), "{:?}", err);
    Ok(())
}
