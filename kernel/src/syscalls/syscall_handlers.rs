use crate::{
    arch::Platform,
    constants::syscalls::{ENOSYS, SYS_EXIT, SYS_GETPID, SYS_YIELD},
    kernel::Kernel,
};

/// Runs system call `number` for the current process.
pub fn dispatch<P: Platform>(kernel: &Kernel<P>, number: u32, arg: u32) -> i32 {
    match number {
        SYS_EXIT => sys_exit(kernel, arg as i32),
        SYS_GETPID => sys_getpid(kernel),
        SYS_YIELD => sys_yield(kernel),
        _ => {
            log::warn!("unknown syscall {}", number);
            ENOSYS
        }
    }
}

fn sys_exit<P: Platform>(kernel: &Kernel<P>, code: i32) -> i32 {
    match kernel.process_exit(code) {
        Ok(()) => 0,
        Err(e) => {
            log::warn!("exit({}) from pid {}: {}", code, kernel.current_pid(), e);
            -1
        }
    }
}

fn sys_getpid<P: Platform>(kernel: &Kernel<P>) -> i32 {
    kernel.current_pid().as_u32() as i32
}

fn sys_yield<P: Platform>(kernel: &Kernel<P>) -> i32 {
    kernel.process_yield();
    0
}
