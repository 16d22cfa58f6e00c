use std::sync::Arc;
use std::thread;

use shader_arena::config::ALLOC_ALIGNMENT;
use shader_arena::{HostMemory, RawShaderAlloc, ShaderAllocator, ShaderBlock};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_env_log::test;

fn rounded(size: usize) -> usize {
    let size = size.max(1);
    (size + ALLOC_ALIGNMENT - 1) / ALLOC_ALIGNMENT * ALLOC_ALIGNMENT
}

#[test]
fn test_stress() {
    let mut allocator: RawShaderAlloc<HostMemory, usize> = RawShaderAlloc::new(HostMemory::new());

    // None means not allocated
    let mut handles: Vec<Option<(ShaderBlock, usize)>> = (0..128).map(|_| None).collect();
    let mut _allocated_count: usize = 0;
    let mut allocated_size: usize = 0;
    let mut _freed_count: usize = 0;
    let mut freed_size: usize = 0;

    fn validate(allocator: &RawShaderAlloc<HostMemory, usize>, allocated_size: usize, freed_size: usize) {
        let validity = allocator.validate();
        let stats = allocator.stats();
        log::info!(
            "Allocated: {}, Freed: {}; Validity: {:?}, Stats: {:?}",
            allocated_size,
            freed_size,
            validity,
            stats,
        );
        log::info!("Arenas: {}", allocator);
        assert!(validity.is_valid());

        assert_eq!(allocated_size - freed_size, stats.allocated_bytes);
        assert_eq!(stats.arena_bytes, stats.allocated_bytes + stats.free_bytes);
        assert_eq!(stats.arena_bytes, allocator.provider().live_bytes());
    }

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    // Mostly small shaders, with the occasional huge one
    let range = rand::distributions::Uniform::new_inclusive(1usize, 128);

    for step in 0..1024 * 10 {
        let chosen = handles.choose_mut(&mut rng).unwrap();
        match chosen.take() {
            None => {
                // Let's try allocating
                let new_size = range.sample(&mut rng) * range.sample(&mut rng) * 4;
                log::info!("Allocating {}", new_size);
                let block = allocator.allocate(new_size, step).unwrap();
                log::info!("  Allocated {:#x} {}", block.va(), block.size());
                assert_eq!(block.size(), rounded(new_size));
                assert_eq!(allocator.find_owner(block.va()), Some(&step));
                allocated_size += block.size();
                _allocated_count += 1;
                *chosen = Some((block, step));
            }
            Some((block, owner)) => {
                // Let's try freeing
                log::info!("Deallocating {:#x} {}", block.va(), block.size());
                assert_eq!(
                    allocator.find_owner(block.va() + block.size() as u64 - 1),
                    Some(&owner)
                );
                freed_size += block.size();
                _freed_count += 1;
                allocator.free(block);
            }
        }

        validate(&allocator, allocated_size, freed_size);
    }

    for slot in handles.iter_mut() {
        if let Some((block, _)) = slot.take() {
            freed_size += block.size();
            allocator.free(block);
        }
    }
    validate(&allocator, allocated_size, freed_size);
    assert_eq!(allocator.arena_count(), 0);
    assert_eq!(allocator.provider().live_regions(), 0);
}

#[test]
fn test_threaded_compiles() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 500;

    let allocator: Arc<ShaderAllocator<HostMemory, (usize, usize)>> =
        Arc::new(ShaderAllocator::new(HostMemory::new()));

    let workers: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(thread_id as u64);
                let range = rand::distributions::Uniform::new_inclusive(1usize, 8192);
                let mut live: Vec<(ShaderBlock, usize)> = Vec::new();

                for round in 0..ROUNDS {
                    let size = range.sample(&mut rng);
                    let mut block = allocator.allocate(size, (thread_id, round)).unwrap();

                    // Fill the block with a pattern only this round writes
                    let pattern = vec![(thread_id * 31 + round) as u8; block.size()];
                    allocator.upload(&mut block, 0, &pattern);
                    live.push((block, round));

                    if live.len() > 16 || rng.next_u32() % 3 == 0 {
                        let index = rng.next_u32() as usize % live.len();
                        let (block, round) = live.swap_remove(index);
                        let expected = (thread_id * 31 + round) as u8;
                        let bytes = unsafe { block.as_slice() };
                        assert!(bytes.iter().all(|&b| b == expected));
                        assert_eq!(
                            allocator.find_owner(block.va()),
                            Some((thread_id, round))
                        );
                        allocator.free(block);
                    }
                }

                for (block, _) in live {
                    allocator.free(block);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let validity = allocator.validate();
    assert!(validity.is_valid(), "{:?}", validity);
    assert_eq!(allocator.stats().arenas, 0);
    assert_eq!(allocator.lock().provider().live_regions(), 0);
}
