//! Fiber walkthrough: manual resume/yield, a worker pool, and a hooked
//! sleep that parks only its fiber.

use std::time::Instant;

use anyhow::Result;
use weft::{hook, kprintln, Fiber, FiberState, IoManager, Thread};

fn main() -> Result<()> {
    // Manual resume/yield against the thread-main fiber
    let generator = Fiber::new(
        || {
            let (mut a, mut b) = (0u64, 1u64);
            for _ in 0..8 {
                kprintln!("fib: {}", a);
                (a, b) = (b, a + b);
                weft::yield_now();
            }
        },
        0,
        false,
    );
    while generator.state() != FiberState::Term {
        generator.resume();
    }

    // A pool: callables land on whichever worker is free
    let iom = IoManager::new(3, true, "demo");
    for i in 0..6 {
        iom.schedule(move || {
            kprintln!("task {} ran on thread {}", i, Thread::gettid());
        });
    }

    // A hooked sleep parks the fiber, not the worker
    let started = Instant::now();
    iom.schedule(move || {
        hook::sleep_ms(300);
        kprintln!("sleeper woke after {:?}", started.elapsed());
    });
    iom.schedule(|| kprintln!("this runs while the sleeper sleeps"));

    iom.stop();
    Ok(())
}
