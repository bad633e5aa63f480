//! Provenance classification.
//!
//! Libc keeps private heap state alive on purpose (stdio buffers, locale
//! tables), and itemizing those as leaks buries the real findings. Each
//! allocation is therefore tagged at insert time: `User` if the immediate
//! caller of the allocator entry point lives outside the C library,
//! `Libc` if it lives inside it. Only the immediate caller is examined; an
//! allocation libc performs on behalf of user code is still a user
//! allocation.
//!
//! Everything here runs inside an intercepted allocator call, so the
//! address-to-image query must not touch the heap. `dladdr` on glibc fills
//! a caller-provided `Dl_info` from the already-loaded link map and
//! qualifies.

use core::ffi::{c_void, CStr};
use core::mem::MaybeUninit;

use once_cell::sync::OnceCell;

/// Origin of an allocation, fixed for the record's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    /// Candidate leak; itemized in the report.
    User,
    /// Libc infrastructure; counted but suppressed.
    Libc,
}

pub struct Classifier {
    /// Load base of the tracker's own image; frames at this base are the
    /// interception machinery, not the program under observation.
    self_base: usize,
}

static CLASSIFIER: OnceCell<Classifier> = OnceCell::new();

/// Cache the tracker's own image base. Called once from runtime init.
pub fn init() {
    let _ = CLASSIFIER.set(Classifier::for_image_of(init as *const c_void));
}

pub fn get() -> &'static Classifier {
    // Falls back to a never-matching base if init was skipped (tests).
    static UNANCHORED: Classifier = Classifier { self_base: 0 };
    CLASSIFIER.get().unwrap_or(&UNANCHORED)
}

impl Classifier {
    /// Classifier for the image containing `anchor`.
    fn for_image_of(anchor: *const c_void) -> Self {
        let self_base = image_of(anchor as usize).map_or(0, |image| image.base);
        Classifier { self_base }
    }

    #[cfg(test)]
    fn with_base(self_base: usize) -> Self {
        Classifier { self_base }
    }

    /// Judge a raw captured stack (most-recent first).
    ///
    /// Returns the index to store the stack from (one frame before the
    /// allocator's immediate caller, so the record keeps the interception
    /// frame on top) and the provenance tag. Frames owned by the
    /// tracker's image are skipped; with no foreign frame to examine the
    /// allocation is reported rather than suppressed.
    pub fn judge(&self, frames: &[usize]) -> (usize, Provenance) {
        let Some(caller) = self.caller_index(frames) else {
            return (0, Provenance::User);
        };
        let provenance = match image_of(frames[caller]) {
            Some(image) if is_libc_image(image.name) => Provenance::Libc,
            _ => Provenance::User,
        };
        (caller.saturating_sub(1), provenance)
    }

    /// Index of the first frame not owned by the tracker's image: the
    /// immediate caller of the intercepted entry point.
    fn caller_index(&self, frames: &[usize]) -> Option<usize> {
        frames.iter().position(|&ip| {
            match image_of(ip) {
                Some(image) => image.base != self.self_base,
                // No owning image (JIT, corrupted frame): foreign.
                None => true,
            }
        })
    }
}

pub struct Image {
    pub base: usize,
    pub name: &'static CStr,
    /// Nearest preceding symbol and the address's offset from it, when the
    /// image exports one.
    pub symbol: Option<(&'static CStr, usize)>,
}

/// Resolve an address to its owning loaded image via `dladdr`.
/// Allocation-free; returns `None` for addresses outside every image.
pub fn image_of(addr: usize) -> Option<Image> {
    let mut info = MaybeUninit::<libc::Dl_info>::uninit();
    unsafe {
        if libc::dladdr(addr as *const c_void, info.as_mut_ptr()) == 0 {
            return None;
        }
        let info = info.assume_init();
        if info.dli_fbase.is_null() || info.dli_fname.is_null() {
            return None;
        }
        let symbol = if info.dli_sname.is_null() || info.dli_saddr.is_null() {
            None
        } else {
            let name: &'static CStr = CStr::from_ptr(info.dli_sname);
            Some((name, addr.saturating_sub(info.dli_saddr as usize)))
        };
        Some(Image {
            base: info.dli_fbase as usize,
            name: CStr::from_ptr(info.dli_fname),
            symbol,
        })
    }
}

fn is_libc_image(name: &CStr) -> bool {
    let bytes = name.to_bytes();
    bytes.windows(b"libc.so".len()).any(|w| w == b"libc.so")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn libc_address() -> usize {
        // A symbol genuinely inside libc.so; going through dlsym avoids
        // landing on this executable's PLT stub.
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"strlen".as_ptr()) };
        assert!(!addr.is_null());
        addr as usize
    }

    fn own_address() -> usize {
        own_address as usize
    }

    #[test]
    fn libc_image_name_match() {
        assert!(is_libc_image(c"/lib/x86_64-linux-gnu/libc.so.6"));
        assert!(is_libc_image(c"libc.so"));
        assert!(!is_libc_image(c"/usr/lib/libfoo.so.1"));
        assert!(!is_libc_image(c"/home/user/app"));
    }

    #[test]
    fn empty_stack_is_user() {
        let classifier = Classifier::with_base(1);
        assert_eq!(classifier.judge(&[]), (0, Provenance::User));
    }

    #[test]
    fn libc_caller_is_infrastructure() {
        // Own image base as "self": the test-function frame is skipped and
        // the libc frame gets judged.
        let self_base = image_of(own_address()).expect("dladdr on test fn").base;
        let classifier = Classifier::with_base(self_base);
        let frames = [own_address(), libc_address()];
        let (start, provenance) = classifier.judge(&frames);
        assert_eq!(provenance, Provenance::Libc);
        assert_eq!(start, 0);
    }

    #[test]
    fn foreign_non_libc_caller_is_user() {
        // A never-matching self base makes the first frame the caller; it
        // resolves to this test executable, which is not libc.
        let classifier = Classifier::with_base(1);
        let frames = [own_address(), libc_address()];
        let (start, provenance) = classifier.judge(&frames);
        assert_eq!(provenance, Provenance::User);
        assert_eq!(start, 0);
    }

    #[test]
    fn all_self_frames_err_toward_reporting() {
        let self_base = image_of(own_address()).expect("dladdr on test fn").base;
        let classifier = Classifier::with_base(self_base);
        let frames = [own_address(), own_address()];
        assert_eq!(classifier.judge(&frames), (0, Provenance::User));
    }
}
