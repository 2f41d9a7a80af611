//! A compiled chunk round-tripped through disk (spec §6's serialized
//! chunk format): `Chunk::serialize`/`deserialize` must survive an
//! actual write-then-read, not just an in-memory byte-slice swap.

use std::fs;
use std::io::Write;

use gal_core::chunk::Chunk;
use gal_runtime::embedder::Embedder;
use tempfile::NamedTempFile;

#[test]
fn a_compiled_chunk_survives_a_round_trip_through_a_real_file() {
    let chunk = gal_compiler::compile(b"local function add(a, b)\n  return a + b\nend\nreturn add(3, 4)", None)
        .expect("compiles");

    let mut file = NamedTempFile::new().expect("creates a temp file");
    file.write_all(&chunk.serialize()).expect("writes the serialized chunk");
    let path = file.path().to_path_buf();

    let bytes = fs::read(&path).expect("reads the chunk back");
    let loaded = Chunk::deserialize(&bytes).expect("the bytes just written deserialize cleanly");

    let mut embedder = Embedder::new_vm();
    let closure = embedder.load(loaded);
    let results = embedder.call(closure, &[]).expect("runs");
    assert_eq!(results[0].as_number(), Some(7.0));
}
