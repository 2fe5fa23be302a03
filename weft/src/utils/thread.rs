use std::io;
use std::mem;

/// Restricts the calling thread to a single CPU.
pub(crate) fn pin_current_thread(cpu: usize) -> io::Result<()> {
    // Safety: cpu_set_t is a plain bitmask and `cpu` is bounds checked by the
    // CPU_SET macro against CPU_SETSIZE.
    let ret = unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set)
    };

    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

// pthread names are capped at 16 bytes, null terminator included.
#[cfg(test)]
const MAX_PTHREAD_NAME_LEN: usize = 16;

/// Name the kernel reports for the calling thread.
#[cfg(test)]
pub(crate) fn get_current_thread_name() -> anyhow::Result<String> {
    use std::ffi::CStr;

    let mut buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        libc::pthread_getname_np(libc::pthread_self(), buf.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };
    if ret != 0 {
        return Err(anyhow::anyhow!("pthread_getname_np failed with error code: {ret}"));
    }

    // Safety: the buffer was zeroed and pthread writes at most len - 1 bytes.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_str()?.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::affinity::allowed_cpus;
    use anyhow::{Result, anyhow};
    use std::thread;

    #[test]
    fn test_pin_current_thread_to_permitted_cpu() -> Result<()> {
        let cpu = allowed_cpus()?[0];

        thread::spawn(move || pin_current_thread(cpu))
            .join()
            .map_err(|_| anyhow!("pinning thread panicked"))??;

        Ok(())
    }

    #[test]
    fn test_get_current_thread_name() -> Result<()> {
        let name = thread::Builder::new()
            .name("weft-probe".to_string())
            .spawn(get_current_thread_name)?
            .join()
            .map_err(|_| anyhow!("naming thread panicked"))??;

        assert_eq!(name, "weft-probe");
        Ok(())
    }
}
