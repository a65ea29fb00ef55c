//! Misuse that the allocator must turn into an abort.
//!
//! Each scenario runs in a child process: the test binary re-executes itself
//! with the scenario's name in the environment, and a constructor runs the
//! scenario before the test harness starts.

use std::{alloc::Layout, env, process::Command};

use postalloc::PostAlloc;

#[global_allocator]
static ALLOC: PostAlloc = PostAlloc;

const SCENARIO_VAR: &str = "POSTALLOC_DEATH_SCENARIO";

const SCENARIOS: &[(&str, fn())] = &[
    ("benign", benign),
    ("free_interior_pointer", free_interior_pointer),
    ("free_stack_pointer", free_stack_pointer),
    ("free_after_flush", free_after_flush),
    ("oversized_dealloc", oversized_dealloc),
    ("smashed_free_list", smashed_free_list),
    #[cfg(feature = "c")]
    ("copy_overflow", copy_overflow),
];

#[ctor::ctor]
fn run_scenario() {
    let Ok(name) = env::var(SCENARIO_VAR) else { return };
    if let Some((_, scenario)) = SCENARIOS.iter().find(|(n, _)| *n == name) {
        scenario();
    }
    std::process::exit(0);
}

fn benign() {
    let layout = Layout::from_size_align(64, 8).unwrap();
    let ptr = ALLOC.allocate(layout).unwrap();
    unsafe { ALLOC.deallocate(ptr, layout) };
}

fn free_interior_pointer() {
    let ptr = ALLOC.allocate(Layout::from_size_align(64, 8).unwrap()).unwrap();
    unsafe { ALLOC.free(ptr.as_ptr().add(8)) };
}

fn free_stack_pointer() {
    let mut local = 0u64;
    unsafe { ALLOC.free((&raw mut local).cast()) };
}

fn free_after_flush() {
    // A size class nothing else in the child uses, so that its slab is
    // released as a whole by the flush.
    let layout = Layout::from_size_align(40000, 8).unwrap();
    let ptr = ALLOC.allocate(layout).unwrap();
    unsafe { ALLOC.deallocate(ptr, layout) };
    ALLOC.flush();
    unsafe { ALLOC.deallocate(ptr, layout) };
}

fn oversized_dealloc() {
    let ptr = ALLOC.allocate(Layout::from_size_align(16, 8).unwrap()).unwrap();
    unsafe { ALLOC.deallocate(ptr, Layout::from_size_align(4096, 8).unwrap()) };
}

fn smashed_free_list() {
    // Objects of a fresh slab are handed out in address order, so the
    // object after `a` is the next free one.
    let layout = Layout::from_size_align(7000, 8).unwrap();
    let a = ALLOC.allocate(layout).unwrap();
    let size = ALLOC.usable_size(a.as_ptr());
    unsafe { a.as_ptr().add(size).cast::<usize>().write(0x4141_4141_4141_4141) };
    let _ = ALLOC.allocate(layout);
    let _ = ALLOC.allocate(layout);
}

#[cfg(feature = "c")]
fn copy_overflow() {
    unsafe extern "C" {
        fn pa_memcpy(dst: *mut u8, src: *const u8, len: usize) -> *mut u8;
    }
    let dst = ALLOC.allocate(Layout::from_size_align(16, 8).unwrap()).unwrap();
    let src = [0u8; 256];
    unsafe { pa_memcpy(dst.as_ptr(), src.as_ptr(), src.len()) };
}

/// Runs `name` in a child, which must abort with one of `messages`.
#[track_caller]
fn expect_death(name: &str, messages: &[&str]) {
    let out = Command::new(env::current_exe().unwrap())
        .env(SCENARIO_VAR, name)
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(!out.status.success(), "{name} survived; stderr: {stderr}");
    assert!(stderr.contains("postalloc: "), "{name}: {stderr}");
    assert!(messages.iter().any(|m| stderr.contains(m)), "{name}: {stderr}");
}

#[test]
fn benign_child_survives() {
    let out = Command::new(env::current_exe().unwrap())
        .env(SCENARIO_VAR, "benign")
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

#[test]
#[cfg(feature = "sanity-checks")]
fn interior_pointer() {
    expect_death("free_interior_pointer", &["not the start of an object"]);
}

#[test]
fn stack_pointer() {
    expect_death("free_stack_pointer", &["not owned by the allocator"]);
}

#[test]
fn freed_slab() {
    // The chunk went back to the backend's cache, which may have claimed
    // its entry or merged it away.
    expect_death("free_after_flush", &["owned by the backend", "not owned by the allocator"]);
}

#[test]
#[cfg(feature = "sanity-checks")]
fn oversized() {
    expect_death("oversized_dealloc", &["larger than its object"]);
}

#[test]
#[cfg(all(feature = "sanity-checks", not(feature = "random-initial")))]
fn overflow_into_free_object() {
    expect_death("smashed_free_list", &["heap corruption"]);
}

#[test]
#[cfg(all(feature = "c", feature = "sanity-checks"))]
fn memcpy_overflow() {
    expect_death("copy_overflow", &["overflows the heap allocation"]);
}
