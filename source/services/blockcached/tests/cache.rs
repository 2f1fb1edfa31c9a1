// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Block cache behaviour observed through fault counts and device I/O.

use std::sync::Arc;

use axon::{AbortCause, ContextId, ErrorClass, Kernel, KernelConfig, SysError};
use axon_rt::{Env, Machine, RunOutcome};
use blockcached::{
    service, BlockCache, BlockDevice, CacheError, IoCounters, MemDisk, BITMAP_START, BLOCK_SECTORS, BLOCK_SIZE,
    DISKMAP, SUPER_BLOCK,
};

const NBLOCKS: u32 = 64;

struct Rig {
    kernel: Kernel,
    id: ContextId,
    cache: BlockCache,
    io: Arc<IoCounters>,
}

impl Rig {
    fn new(disk: MemDisk) -> Self {
        let mut kernel = Kernel::boot(KernelConfig::default()).expect("boot");
        let id = kernel.spawn().expect("spawn");
        let io = disk.counters();
        let cache = BlockCache::new(disk);
        cache.attach(&mut Env::new(&mut kernel, id)).expect("attach");
        Self { kernel, id, cache, io }
    }

    fn formatted() -> Self {
        Self::new(MemDisk::format(NBLOCKS))
    }

    fn env(&mut self) -> Env<'_> {
        Env::new(&mut self.kernel, self.id)
    }

    fn faults(&self) -> u64 {
        self.kernel.stats(self.id).expect("stats").faults
    }

    fn mount(&mut self) {
        let cache = self.cache.clone();
        cache.mount(&mut self.env()).expect("mount");
    }
}

fn addr(block: u32) -> usize {
    DISKMAP + block as usize * BLOCK_SIZE
}

fn handler_abort(err: SysError) -> ErrorClass {
    match err {
        SysError::Aborted(report) => match report.cause {
            AbortCause::Handler(class) => class,
            other => panic!("unexpected abort cause {other:?}"),
        },
        other => panic!("expected an abort, got {other:?}"),
    }
}

#[test]
fn first_touch_faults_once_reads_once_and_stays_clean() {
    let mut rig = Rig::formatted();
    let (faults, reads) = (rig.faults(), rig.io.reads());

    let mut env = rig.env();
    assert_eq!(env.read_u32(addr(5)).expect("read"), 0);
    assert!(!env.is_dirty(addr(5)).expect("query"));
    env.read_u32(addr(5) + 100).expect("cached read");

    assert_eq!(rig.faults(), faults + 1);
    assert_eq!(rig.io.reads(), reads + 1);
}

#[test]
fn flush_of_uncached_block_writes_nothing() {
    let mut rig = Rig::formatted();
    let cache = rig.cache.clone();
    let mut env = rig.env();
    cache.flush(&mut env, addr(9)).expect("flush");
    assert!(!env.is_mapped(addr(9)).expect("query"));
    assert_eq!(rig.io.writes(), 0);
    assert!(rig.io.written_sectors().is_empty());
}

#[test]
fn flush_writes_dirty_block_exactly_once() {
    let mut rig = Rig::formatted();
    let cache = rig.cache.clone();
    let mut env = rig.env();
    env.write_u32(addr(7), 0xC0FFEE).expect("write");
    assert!(env.is_dirty(addr(7)).expect("query"));

    cache.flush(&mut env, addr(7) + 12).expect("flush");
    assert!(!env.is_dirty(addr(7)).expect("query"));
    assert!(env.is_mapped(addr(7)).expect("query"));
    cache.flush(&mut env, addr(7)).expect("second flush");
    assert_eq!(rig.io.writes(), 1);
    assert_eq!(rig.io.written_sectors(), vec![7 * BLOCK_SECTORS]);
}

#[test]
fn flushed_block_survives_eviction() {
    let mut rig = Rig::formatted();
    rig.mount();
    let cache = rig.cache.clone();
    let mut env = rig.env();
    cache.write_block(&mut env, SUPER_BLOCK, b"OOPS!\n").expect("smash");
    cache.flush(&mut env, addr(SUPER_BLOCK)).expect("flush");
    cache.evict(&mut env, SUPER_BLOCK).expect("evict");
    assert!(!env.is_mapped(addr(SUPER_BLOCK)).expect("query"));

    let mut back = [0u8; 6];
    cache.read_block(&mut env, SUPER_BLOCK, &mut back).expect("reload");
    assert_eq!(&back, b"OOPS!\n");
    assert_eq!(rig.io.written_sectors(), vec![SUPER_BLOCK * BLOCK_SECTORS]);
}

#[test]
fn evicting_without_flush_drops_the_change() {
    let mut rig = Rig::formatted();
    let cache = rig.cache.clone();
    let mut env = rig.env();
    env.write_u32(addr(20), 1).expect("write");
    cache.evict(&mut env, 20).expect("evict");
    assert_eq!(env.read_u32(addr(20)).expect("reload"), 0);
    assert_eq!(rig.io.writes(), 0);
}

#[test]
fn self_check_passes_and_restores_the_super_block() {
    let mut rig = Rig::formatted();
    rig.mount();
    let cache = rig.cache.clone();
    let mut env = rig.env();
    cache.check(&mut env).expect("check");
    cache.evict(&mut env, SUPER_BLOCK).expect("evict");
    cache.mount(&mut env).expect("remount after check");
    assert_eq!(cache.nblocks(), Some(NBLOCKS));
}

#[test]
fn mount_rejects_unformatted_disk() {
    let mut rig = Rig::new(MemDisk::new(NBLOCKS));
    let cache = rig.cache.clone();
    assert_eq!(cache.mount(&mut rig.env()), Err(CacheError::BadMagic { found: 0 }));
    assert_eq!(cache.nblocks(), None);
}

#[test]
fn bitmap_reports_free_and_reserved_blocks() {
    let mut disk = MemDisk::format(NBLOCKS);
    disk.mark_used(10);
    let mut rig = Rig::new(disk);
    rig.mount();
    let cache = rig.cache.clone();
    let mut env = rig.env();
    for block in [0, SUPER_BLOCK, BITMAP_START, 10] {
        assert!(!cache.block_is_free(&mut env, block).expect("bitmap"), "block {block}");
    }
    assert!(cache.block_is_free(&mut env, 11).expect("bitmap"));
    assert!(!cache.block_is_free(&mut env, NBLOCKS).expect("bitmap"));
}

#[test]
fn reading_a_free_block_after_mount_aborts() {
    let mut rig = Rig::formatted();
    rig.mount();
    let id = rig.id;
    let err = rig.env().read_u32(addr(30)).expect_err("free block");
    assert_eq!(handler_abort(err), ErrorClass::ProtocolViolation);
    assert_eq!(rig.kernel.status(id), None);
}

#[test]
fn bitmap_check_follows_the_fill_through_a_nested_fault() {
    let mut disk = MemDisk::format(NBLOCKS);
    disk.mark_used(12);
    disk.write_sectors(12 * BLOCK_SECTORS, &[0xAB; BLOCK_SIZE]).expect("seed");
    let mut rig = Rig::new(disk);
    rig.mount();
    let cache = rig.cache.clone();
    cache.evict(&mut rig.env(), BITMAP_START).expect("evict bitmap");

    let (faults, reads) = (rig.faults(), rig.io.reads());
    let mut env = rig.env();
    assert_eq!(env.read_u32(addr(12)).expect("read"), 0xABAB_ABAB);
    assert!(env.is_mapped(addr(BITMAP_START)).expect("query"));
    assert!(!env.is_dirty(addr(12)).expect("query"));
    assert_eq!(rig.faults(), faults + 2);
    assert_eq!(rig.io.reads(), reads + 2);
}

#[test]
fn out_of_range_block_after_mount_aborts() {
    let mut rig = Rig::formatted();
    rig.mount();
    assert_eq!(rig.cache.block_address(NBLOCKS), Err(CacheError::BadBlock { block: NBLOCKS }));
    let err = rig.env().read_u32(addr(NBLOCKS)).expect_err("past the volume");
    assert_eq!(handler_abort(err), ErrorClass::InvalidAddress);
}

#[test]
fn fault_outside_the_window_is_refused() {
    let mut rig = Rig::formatted();
    let err = rig.env().read_u32(DISKMAP - BLOCK_SIZE).expect_err("below the window");
    assert_eq!(handler_abort(err), ErrorClass::InvalidAddress);
}

#[test]
fn device_error_during_fill_is_fatal_io() {
    let mut rig = Rig::formatted();
    rig.io.fail_next_io();
    let err = rig.env().read_u32(addr(4)).expect_err("disk failure");
    assert_eq!(handler_abort(err), ErrorClass::FatalIo);
}

#[test]
fn service_program_runs_to_completion() {
    let mut machine = Machine::boot(KernelConfig::default()).expect("boot");
    let disk = MemDisk::format(NBLOCKS);
    let io = disk.counters();
    machine.spawn(service(BlockCache::new(disk))).expect("spawn");
    assert_eq!(machine.run(10), RunOutcome::Monitor);
    assert_eq!(io.written_sectors(), vec![SUPER_BLOCK * BLOCK_SECTORS; 2]);
    assert_eq!(machine.kernel().frames_in_use(), 0);
}

#[test]
fn service_halts_on_a_corrupt_volume() {
    let mut machine = Machine::boot(KernelConfig::default()).expect("boot");
    let id = machine.spawn(service(BlockCache::new(MemDisk::new(NBLOCKS)))).expect("spawn");
    let RunOutcome::Halted(panic) = machine.run(10) else {
        panic!("an unformatted disk must halt the service");
    };
    assert_eq!(panic.ctx, Some(id));
    assert_eq!(panic.error.class(), ErrorClass::ProtocolViolation);
}
