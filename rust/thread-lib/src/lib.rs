use libc::{
    CPU_ISSET, CPU_SET, CPU_SETSIZE, CPU_ZERO, cpu_set_t, pthread_getaffinity_np,
    pthread_self, pthread_setaffinity_np,
};
use syscalls::Errno;

/// Pin the calling thread to `cpu`.
pub fn pin_cpu(cpu: usize) -> Result<(), Errno> {
    if cpu >= CPU_SETSIZE as usize {
        return Err(Errno::EINVAL);
    }
    unsafe {
        let mut cpuset: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut cpuset);
        CPU_SET(cpu, &mut cpuset);
        let ret = pthread_setaffinity_np(pthread_self(), size_of::<cpu_set_t>(), &cpuset);
        if ret != 0 {
            return Err(Errno::new(ret));
        }
    }
    Ok(())
}

/// CPUs the calling thread is currently allowed to run on.
pub fn allowed_cpus() -> Result<Vec<usize>, Errno> {
    unsafe {
        let mut cpuset: cpu_set_t = std::mem::zeroed();
        let ret =
            pthread_getaffinity_np(pthread_self(), size_of::<cpu_set_t>(), &mut cpuset);
        if ret != 0 {
            return Err(Errno::new(ret));
        }
        Ok((0..CPU_SETSIZE as usize).filter(|&cpu| CPU_ISSET(cpu, &cpuset)).collect())
    }
}
