mod common;

use common::{keys_for, sample_tree, site};
use sitebundle::{FileKeyStore, KeyStore, KeyVersion, Packager, SiteIdentity, Verifier};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const READERS: usize = 4;

#[test]
fn test_rotation_never_disturbs_readers() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let neighbour = SiteIdentity::new("mirror.freedom")?;
    let keys = keys_for(&site);
    keys.generate(&neighbour)?;

    let tree = sample_tree();
    let v1_bundle = Packager::new(&keys).seal_to_bytes(&tree, &site)?;
    let v1_key = keys.resolve(&site, Some(KeyVersion::FIRST))?.key;
    let neighbour_bundle = Packager::new(&keys).seal_to_bytes(&tree, &neighbour)?;
    let done = AtomicBool::new(false);

    let reads: usize = thread::scope(|scope| {
        let rotator = scope.spawn(|| {
            for _ in 0..200 {
                keys.rotate(&site).expect("rotate");
            }
            done.store(true, Ordering::SeqCst);
        });

        let mut readers = Vec::with_capacity(READERS);
        for _ in 0..READERS {
            readers.push(scope.spawn(|| {
                let mut reads = 0;
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    let material = keys
                        .resolve(&site, Some(KeyVersion::FIRST))
                        .expect("v1 stays resolvable during rotation");
                    assert_eq!(material.key, v1_key);
                    let opened = Verifier::new(&keys)
                        .open(&v1_bundle)
                        .expect("v1 bundle opens during rotation");
                    assert_eq!(opened.len(), tree.len());

                    keys.resolve(&neighbour, None)
                        .expect("other sites are never blocked");
                    Verifier::new(&keys)
                        .open(&neighbour_bundle)
                        .expect("other site's bundle opens");
                    reads += 1;
                    if finished {
                        break reads;
                    }
                }
            }));
        }

        rotator.join().expect("rotator panicked");
        readers
            .into_iter()
            .map(|h| h.join().expect("reader panicked"))
            .sum::<usize>()
    });

    assert!(reads >= READERS);
    assert_eq!(keys.versions(&site)?.0.get(), 201);
    assert_eq!(keys.versions(&neighbour)?.0, KeyVersion::FIRST);
    Ok(())
}

#[test]
fn test_file_store_rotation_never_disturbs_readers() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let site = site();
    let writer = FileKeyStore::new(dir.path());
    writer.generate(&site)?;
    let v1_bundle = Packager::new(&writer).seal_to_bytes(&sample_tree(), &site)?;
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let rotator = scope.spawn(|| {
            for _ in 0..20 {
                writer.rotate(&site).expect("rotate");
            }
            done.store(true, Ordering::SeqCst);
        });

        let mut readers = Vec::with_capacity(READERS);
        for _ in 0..READERS {
            readers.push(scope.spawn(|| {
                // Each reader uses its own handle on the same directory
                let reader = FileKeyStore::new(dir.path());
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    reader
                        .resolve(&site, None)
                        .expect("active key resolves during rotation");
                    Verifier::new(&reader)
                        .open(&v1_bundle)
                        .expect("v1 bundle opens during rotation");
                    if finished {
                        break;
                    }
                }
            }));
        }

        rotator.join().expect("rotator panicked");
        for reader in readers {
            reader.join().expect("reader panicked");
        }
    });

    assert_eq!(writer.versions(&site)?.1.len(), 21);
    Ok(())
}
