//! An example program where several "compiler" threads share one shader
//! allocator: each compiles random shaders into it, uploads the code, and
//! destroys older pipelines along the way. At the end a fake GPU fault
//! address is attributed back to the shader that contains it.

use std::sync::Arc;
use std::thread;

use shader_arena::{RegionProvider, ShaderAllocator, ShaderBlock};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, SeedableRng};

#[cfg(feature = "use_libc")]
type Backing = shader_arena::MmapMemory;
#[cfg(not(feature = "use_libc"))]
type Backing = shader_arena::HostMemory;

// Number of compiler threads
const THREADS: usize = 4;
// Shaders compiled by each thread
const SHADERS: usize = 4 * 1024;
// Pipelines each thread keeps alive at most
const LIVE_PIPELINES: usize = 64;

#[derive(Clone, Debug)]
struct ShaderName {
    thread: usize,
    index: usize,
}

// Pretend to compile a shader: a few instructions up to a few pages of them.
fn compile<R: Rng>(rng: &mut R) -> Vec<u8> {
    let words = Uniform::new_inclusive(4usize, 4096).sample(rng);
    (0..words)
        .flat_map(|_| rng.next_u32().to_le_bytes().to_vec())
        .collect()
}

fn compiler_thread<P: RegionProvider>(
    allocator: &ShaderAllocator<P, ShaderName>,
    thread: usize,
    shaders: usize,
) -> Option<u64> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(thread as u64);
    let mut live: Vec<ShaderBlock> = Vec::new();

    for index in 0..shaders {
        let code = compile(&mut rng);
        let mut block = match allocator.allocate(code.len(), ShaderName { thread, index }) {
            Ok(block) => block,
            Err(err) => {
                log::error!("Thread {} could not place shader {}: {}", thread, index, err);
                break;
            }
        };
        allocator.upload(&mut block, 0, &code);
        live.push(block);

        if live.len() > LIVE_PIPELINES || rng.gen_bool(0.3) {
            let ix = Uniform::new(0, live.len()).sample(&mut rng);
            allocator.free(live.swap_remove(ix));
        }
    }

    // Keep one shader around for the fault lookup, free the rest
    let kept = live.pop();
    for block in live {
        allocator.free(block);
    }
    // Dropping a handle does not free its block; it stays until teardown
    kept.map(|block| block.va() + block.size() as u64 / 2)
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [THREADS] [SHADERS]", args[0]);
        return;
    }
    let threads: usize = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(THREADS);
    let shaders: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(SHADERS);

    env_logger::init();
    println!("Running Compile Threads.\n\nParameters:");
    println!("    {} compiler threads", threads);
    println!("    {} shaders per thread", shaders);

    let allocator: Arc<ShaderAllocator<Backing, ShaderName>> =
        Arc::new(ShaderAllocator::new(Backing::default()));

    let workers: Vec<_> = (0..threads)
        .map(|id| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || compiler_thread(&allocator, id, shaders))
        })
        .collect();

    let faults: Vec<u64> = workers
        .into_iter()
        .filter_map(|worker| worker.join().expect("compiler thread panicked"))
        .collect();

    let stats = allocator.stats();
    println!("\nFinished.");
    println!("    Stats:    {:?}", stats);
    log::debug!("Arenas: {}", *allocator.lock());
    assert!(allocator.validate().is_valid());

    for fault in faults {
        match allocator.find_owner(fault) {
            Some(name) => println!(
                "    GPU fault at {:#x} is in shader {} of thread {}",
                fault, name.index, name.thread
            ),
            None => println!("    GPU fault at {:#x} is not in any shader", fault),
        }
    }

    match Arc::try_unwrap(allocator) {
        Ok(allocator) => allocator.teardown(),
        Err(_) => unreachable!("all compiler threads have been joined"),
    }
}
