//! Host file descriptors exposed to the guest.
//!
//! The guest only ever sees descriptors 0/1/2 (stdin/stdout/stderr); `open`
//! is explicitly unsupported (§4.F), so this table never grows at runtime.
//! Handlers go through the raw fd for `read`/`write`/`lseek`/`ioctl` rather
//! than buffered `std::io`, since `llseek` and `ioctl` have no buffered-I/O
//! equivalent and the syscalls being emulated are themselves raw.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

/// A single guest-visible descriptor.
pub trait Descriptor {
    fn fileno(&self) -> RawFd;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fileno(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fileno(), buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A host standard stream (stdin/stdout/stderr), accessed by raw fd.
pub struct StdStream {
    fd: RawFd,
}

impl StdStream {
    pub fn stdin() -> Self {
        StdStream { fd: io::stdin().as_raw_fd() }
    }

    pub fn stdout() -> Self {
        StdStream { fd: io::stdout().as_raw_fd() }
    }

    pub fn stderr() -> Self {
        StdStream { fd: io::stderr().as_raw_fd() }
    }
}

impl Descriptor for StdStream {
    fn fileno(&self) -> RawFd {
        self.fd
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.fd {
            1 => io::Write::flush(&mut io::stdout()),
            2 => io::Write::flush(&mut io::stderr()),
            _ => Ok(()),
        }
    }
}

/// In-memory descriptor used by tests in place of a real host stream.
#[cfg(test)]
pub struct MemoryDescriptor {
    pub data: Vec<u8>,
    pub cursor: usize,
}

#[cfg(test)]
impl MemoryDescriptor {
    pub fn new() -> Self {
        MemoryDescriptor { data: Vec::new(), cursor: 0 }
    }
}

#[cfg(test)]
impl Descriptor for MemoryDescriptor {
    fn fileno(&self) -> RawFd {
        -1
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (self.data.len() - self.cursor).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// The fixed table of guest descriptors: stdin, stdout, stderr.
pub struct DescriptorTable {
    entries: Vec<Box<dyn Descriptor>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        DescriptorTable {
            entries: vec![Box::new(StdStream::stdin()), Box::new(StdStream::stdout()), Box::new(StdStream::stderr())],
        }
    }

    pub fn get_mut(&mut self, fd: i32) -> Option<&mut Box<dyn Descriptor>> {
        if fd < 0 {
            return None;
        }
        self.entries.get_mut(fd as usize)
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}
