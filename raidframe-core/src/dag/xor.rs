// vim: tw=80
//! Word-wise XOR primitives underlying every redundancy computation

use std::{mem, ops::Deref};

use crate::types::*;

const WORD: usize = mem::size_of::<usize>();

fn load(b: &[u8]) -> usize {
    let mut w = [0u8; WORD];
    w.copy_from_slice(b);
    usize::from_ne_bytes(w)
}

/// XOR `src` into `dst`, one machine word at a time.
///
/// Both buffers must have the same length, which must be a multiple of the
/// machine word size.
pub fn bxor(src: &[u8], dst: &mut [u8]) -> Result<()> {
    if src.len() != dst.len() || src.len() % WORD != 0 {
        return Err(Error::EINVAL);
    }
    for (s, d) in src.chunks_exact(WORD).zip(dst.chunks_exact_mut(WORD)) {
        let x = load(s) ^ load(d);
        d.copy_from_slice(&x.to_ne_bytes());
    }
    Ok(())
}

/// XOR a buffer scattered across several pages into a contiguous destination.
///
/// The working position is resynchronized at every page boundary.  A page
/// that turns out to be empty, or running out of pages before `dst` is
/// filled, is a fault.
pub fn xor_into<T>(pages: &[T], dst: &mut [u8]) -> Result<()>
    where T: Deref<Target=[u8]>
{
    if dst.len() % WORD != 0 {
        return Err(Error::EINVAL);
    }
    let mut pages = pages.iter();
    let mut page: &[u8] = &[];
    let mut off = 0;
    while off < dst.len() {
        if page.is_empty() {
            page = match pages.next() {
                Some(p) if !p.is_empty() => &p[..],
                _ => return Err(Error::EFAULT)
            };
            if page.len() % WORD != 0 {
                return Err(Error::EINVAL);
            }
        }
        let n = page.len().min(dst.len() - off);
        bxor(&page[..n], &mut dst[off..off + n])?;
        page = &page[n..];
        off += n;
    }
    Ok(())
}

// LCOV_EXCL_STOP
