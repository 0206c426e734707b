#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod bare_metal {
    use kestrel::arch::x86::X86;
    use kestrel::config::BootConfig;
    use kestrel::{idle_loop, init, serial_println};

    /// Entered from the multiboot stub with `mem_upper` in KiB, interrupts
    /// masked and paging off.
    #[no_mangle]
    extern "C" fn kmain(mem_upper_kib: u32) -> ! {
        serial_println!("Booting kestrel...");

        let machine = X86::new(init::process_trampoline);
        machine.log_cpu_features();
        let kernel = init::boot(machine, BootConfig::from_multiboot(mem_upper_kib));

        let frames = kernel.pfa_stats();
        serial_println!(
            "{} of {} frames free, heap at {:#x}",
            frames.free,
            frames.total,
            kernel.config().heap_start
        );

        // the kernel process runs whatever is ready and reaps what exited
        loop {
            kernel.process_yield();
            kernel.process_cleanup();
            if kernel.ready_queue().is_empty() {
                idle_loop();
            }
        }
    }

    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        serial_println!("Kernel panic: {}", info);
        idle_loop();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    use kestrel::arch::hosted::Hosted;
    use kestrel::config::BootConfig;
    use kestrel::init;
    use kestrel::processes::process::{Pid, Priority};
    use kestrel::{debug_println, serial_println};

    let config = BootConfig::default();
    let kernel = init::boot(Hosted::new(&config), config);

    for (name, priority) in [
        ("counter", Priority::Normal),
        ("greeter", Priority::High),
        ("sleeper", Priority::Low),
    ] {
        let spawned = kernel.process_create(name, priority, move || {
            let pid = init::current_pid();
            let buffer = init::kcalloc(16, 64);
            serial_println!("{} running as pid {}", name, pid);
            if let Some(buffer) = buffer {
                init::kfree(buffer);
            }
        });
        match spawned {
            Ok(pid) => debug_println!("spawned {} as pid {}", name, pid),
            Err(e) => serial_println!("could not spawn {}: {}", name, e),
        }
    }
    kernel.log_process_table();

    // hosted switches are only recorded, so the kernel runs each entry itself
    loop {
        if init::run_current_process() {
            continue;
        }
        if kernel.current_pid() == Pid::KERNEL && kernel.ready_queue().is_empty() {
            break;
        }
        kernel.process_yield();
    }

    let reaped = kernel.process_cleanup();
    let heap = kernel.heap_stats();
    serial_println!(
        "reaped {} processes, heap {} used / {} free",
        reaped,
        heap.used,
        heap.free
    );
    kernel.log_process_table();
}
