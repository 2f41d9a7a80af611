//! End-to-end incremental-collection behavior (spec §8 scenario 5):
//! allocate a batch of unreferenced tables, step the collector in
//! bounded increments, and check the live byte count settles back down
//! near the surviving set rather than drifting upward forever.

use gal_runtime::embedder::Embedder;
use gal_runtime::gc::Phase;

fn run_to_pause(embedder: &mut Embedder) {
    loop {
        embedder.gc_step(1024);
        if embedder.vm.collector.phase == Phase::Pause {
            break;
        }
    }
}

#[test]
fn unreferenced_tables_are_reclaimed_within_a_few_cycles() {
    let mut embedder = Embedder::new_vm();

    // A handful of tables kept alive through a global, and a much larger
    // batch that's immediately garbage.
    let chunk = gal_compiler::compile(
        b"keep = {}\nfor i = 1, 20 do\n  keep[i] = {}\nend\nreturn keep",
        None,
    )
    .expect("compiles");
    let closure = embedder.load(chunk);
    embedder.call(closure, &[]).expect("builds the kept set");
    let live_bytes_after_keep = embedder.vm.allocator.total_bytes();

    let garbage = gal_compiler::compile(b"for i = 1, 4000 do\n  local t = {i, i, i}\nend\nreturn 0", None)
        .expect("compiles");
    let garbage_closure = embedder.load(garbage);
    embedder.call(garbage_closure, &[]).expect("allocates throwaway tables");
    let peak_bytes = embedder.vm.allocator.total_bytes();
    assert!(peak_bytes > live_bytes_after_keep, "the garbage batch should have grown the heap");

    // Interleave bounded steps rather than a single sweep-everything call
    // — `gc_step` must never need to walk the whole heap in one shot.
    for _ in 0..64 {
        embedder.gc_step(128);
    }
    run_to_pause(&mut embedder);

    let settled_bytes = embedder.vm.allocator.total_bytes();
    assert!(
        settled_bytes <= live_bytes_after_keep + live_bytes_after_keep / 10,
        "expected settled heap ({settled_bytes}) within 10% of the live set ({live_bytes_after_keep})"
    );
    assert!(settled_bytes < peak_bytes, "collection should have reclaimed some of the garbage batch");
}

#[test]
fn gc_step_returns_promptly_under_a_small_budget() {
    let mut embedder = Embedder::new_vm();
    let chunk = gal_compiler::compile(b"for i = 1, 500 do\n  local t = {i}\nend\nreturn 0", None).expect("compiles");
    let closure = embedder.load(chunk);
    embedder.call(closure, &[]).expect("allocates");

    // A budget of 1 must still make forward progress through the phase
    // state machine rather than stalling in `Pause`.
    let starting_phase = embedder.vm.collector.phase;
    embedder.gc_step(1);
    assert_ne!(embedder.vm.collector.phase, starting_phase, "a single unit of work should advance the phase");
}
