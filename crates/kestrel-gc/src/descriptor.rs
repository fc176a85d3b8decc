//! Packed object layout descriptors.
//!
//! A [`Descriptor`] is one machine word. The low three bits select the
//! encoding; the rest hold the object size and where its reference slots
//! are. Bitmaps that do not fit in the word live in a process-wide side
//! table and the descriptor stores their index instead.
//!
//! Bit indices in object bitmaps count words from the start of the object,
//! header included. The two header words never hold references, so the
//! in-word bitmap encodings drop them.
//!
//! | kind          | payload                                                        |
//! |---------------|----------------------------------------------------------------|
//! | run length    | size (bits 3..16), first ref word (16..24), ref count (24..32) |
//! | small bitmap  | size (bits 3..16), bitmap of words 2.. (16..)                  |
//! | large bitmap  | bitmap of words 2.. (3..), size from the type                  |
//! | complex       | side-table index (3..), size from the type                     |
//! | vector        | element size (3..13), subtype (14..16), element layout (16..)  |
//! | complex array | side-table index of the element bitmap (3..)                   |

use parking_lot::RwLock;

use crate::error::gc_fatal;
use crate::object::{align_up, HEADER_WORDS};

const BITS_PER_WORD: usize = usize::BITS as usize;
const WORD_SIZE: usize = std::mem::size_of::<usize>();

const LOW_TYPE_BITS: u32 = 3;
const TYPE_MASK: usize = 0x7;

/// Largest object size a run-length or small-bitmap descriptor can carry.
pub const MAX_ENCODED_SIZE: usize = 0xfff8;
const SIZE_MASK: usize = 0xfff8;

const SMALL_BITMAP_SHIFT: u32 = 16;
const SMALL_BITMAP_SIZE: usize = BITS_PER_WORD - SMALL_BITMAP_SHIFT as usize;
const LARGE_BITMAP_SIZE: usize = BITS_PER_WORD - LOW_TYPE_BITS as usize;

const VECTOR_ELSIZE_SHIFT: u32 = 3;
const VECTOR_SUBTYPE_SHIFT: u32 = 14;
const VECTOR_LAYOUT_SHIFT: u32 = 16;

/// Largest array element a vector descriptor can describe inline.
pub const MAX_ELEMENT_SIZE: usize = 0x3ff;

const DESC_RUN_LENGTH: usize = 0;
const DESC_SMALL_BITMAP: usize = 1;
const DESC_LARGE_BITMAP: usize = 2;
const DESC_COMPLEX: usize = 3;
const DESC_VECTOR: usize = 4;
const DESC_COMPLEX_ARRAY: usize = 5;

const SUBTYPE_PTR_FREE: usize = 0;
const SUBTYPE_REFS: usize = 1;
const SUBTYPE_RUN_LENGTH: usize = 2;
const SUBTYPE_BITMAP: usize = 3;

/// The encoding a descriptor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Size plus one contiguous run of reference words.
    RunLength,
    /// Size plus an in-word bitmap.
    SmallBitmap,
    /// In-word bitmap covering up to 61 payload words.
    LargeBitmap,
    /// Bitmap stored in the side table.
    Complex,
    /// Array whose element layout fits in the word.
    Vector,
    /// Array whose element bitmap is stored in the side table.
    ComplexArray,
}

/// How the elements of a [`DescriptorKind::Vector`] hold references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorSubtype {
    /// Elements contain no references.
    PtrFree,
    /// Every element word is a reference.
    Refs,
    /// One contiguous run of references per element.
    RunLength,
    /// A bitmap per element.
    Bitmap,
}

/// A packed, immutable layout descriptor shared by all objects of a type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(usize);

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Descriptor({:?}, {:#x})", self.kind(), self.0)
    }
}

// ============================================================================
// Side table
// ============================================================================

/// Oversized bitmaps. Each record is `[nwords, bitmap[0], .., bitmap[nwords - 2]]`.
static COMPLEX_DESCRIPTORS: RwLock<Vec<usize>> = RwLock::new(Vec::new());

/// Store `bitmap` in the side table, reusing an identical record if present.
fn alloc_complex_descriptor(bitmap: &[usize], numbits: usize) -> usize {
    let nwords = numbits / BITS_PER_WORD + 2;
    let words = |i: usize| bitmap.get(i).copied().unwrap_or(0);

    let mut table = COMPLEX_DESCRIPTORS.write();
    let mut i = 0;
    while i < table.len() {
        let len = table[i];
        if len == nwords && (0..nwords - 1).all(|j| table[i + 1 + j] == words(j)) {
            return i;
        }
        i += len;
    }

    let index = table.len();
    table.push(nwords);
    for j in 0..nwords - 1 {
        table.push(words(j));
    }
    index
}

/// Run `f` over the bitmap words of the side-table record at `index`.
pub(crate) fn with_complex_bitmap<R>(index: usize, f: impl FnOnce(&[usize]) -> R) -> R {
    let table = COMPLEX_DESCRIPTORS.read();
    let Some(&nwords) = table.get(index) else {
        gc_fatal!("complex descriptor index {index} out of range");
    };
    f(&table[index + 1..index + nwords])
}

struct BitStats {
    first: Option<usize>,
    last: usize,
    count: usize,
}

fn bit_stats(bitmap: &[usize], numbits: usize) -> BitStats {
    let mut stats = BitStats {
        first: None,
        last: 0,
        count: 0,
    };
    for i in 0..numbits {
        if bitmap.get(i / BITS_PER_WORD).copied().unwrap_or(0) & (1 << (i % BITS_PER_WORD)) != 0 {
            stats.first.get_or_insert(i);
            stats.last = i;
            stats.count += 1;
        }
    }
    stats
}

/// Build a bitmap with the given word indices set.
#[must_use]
pub fn bitmap_from_words(words: &[usize]) -> (Vec<usize>, usize) {
    let numbits = words.iter().map(|w| w + 1).max().unwrap_or(0);
    let mut bitmap = vec![0usize; numbits.div_ceil(BITS_PER_WORD).max(1)];
    for &w in words {
        bitmap[w / BITS_PER_WORD] |= 1 << (w % BITS_PER_WORD);
    }
    (bitmap, numbits)
}

/// Bits `from..from + BITS_PER_WORD` of `bitmap`, shifted down to bit 0.
fn window(bitmap: &[usize], from: usize) -> usize {
    let word = from / BITS_PER_WORD;
    let shift = from % BITS_PER_WORD;
    let lo = bitmap.get(word).copied().unwrap_or(0) >> shift;
    if shift == 0 {
        lo
    } else {
        lo | (bitmap.get(word + 1).copied().unwrap_or(0) << (BITS_PER_WORD - shift))
    }
}

impl Descriptor {
    /// Descriptor for a fixed-size object of `obj_size` bytes whose reference
    /// words are the set bits of `bitmap` (word 0 is the first header word).
    ///
    /// # Panics
    ///
    /// Panics if a header word is marked as a reference.
    #[must_use]
    pub fn for_object(bitmap: &[usize], numbits: usize, obj_size: usize) -> Self {
        let stats = bit_stats(bitmap, numbits);
        let stored_size = align_up(obj_size);

        let Some(first) = stats.first else {
            if stored_size <= MAX_ENCODED_SIZE {
                return Self(DESC_RUN_LENGTH | stored_size);
            }
            return Self(DESC_LARGE_BITMAP);
        };
        assert!(first >= HEADER_WORDS, "object header words cannot hold references");

        if stored_size <= MAX_ENCODED_SIZE {
            if first < 256 && stats.count < 256 && first + stats.count == stats.last + 1 {
                return Self(DESC_RUN_LENGTH | stored_size | (first << 16) | (stats.count << 24));
            }
            if stats.last < SMALL_BITMAP_SIZE + HEADER_WORDS {
                let bits = window(bitmap, HEADER_WORDS);
                return Self(DESC_SMALL_BITMAP | stored_size | (bits << SMALL_BITMAP_SHIFT));
            }
        }
        if stats.last < LARGE_BITMAP_SIZE + HEADER_WORDS {
            let bits = window(bitmap, HEADER_WORDS);
            return Self(DESC_LARGE_BITMAP | (bits << LOW_TYPE_BITS));
        }
        Self(DESC_COMPLEX | (alloc_complex_descriptor(bitmap, stats.last + 1) << LOW_TYPE_BITS))
    }

    /// Descriptor for an array whose `elem_size`-byte elements have reference
    /// words at the set bits of `elem_bitmap` (word 0 is the element's first word).
    #[must_use]
    pub fn for_array(elem_bitmap: &[usize], numbits: usize, elem_size: usize) -> Self {
        let stats = bit_stats(elem_bitmap, numbits);

        if elem_size <= MAX_ELEMENT_SIZE {
            let desc = DESC_VECTOR | (elem_size << VECTOR_ELSIZE_SHIFT);
            let Some(first) = stats.first else {
                return Self(desc | (SUBTYPE_PTR_FREE << VECTOR_SUBTYPE_SHIFT));
            };
            if stats.count * WORD_SIZE == elem_size {
                return Self(desc | (SUBTYPE_REFS << VECTOR_SUBTYPE_SHIFT));
            }
            if first < 256 && stats.count < 256 && first + stats.count == stats.last + 1 {
                return Self(
                    desc | (SUBTYPE_RUN_LENGTH << VECTOR_SUBTYPE_SHIFT)
                        | (first << VECTOR_LAYOUT_SHIFT)
                        | (stats.count << (VECTOR_LAYOUT_SHIFT + 8)),
                );
            }
            if stats.last < BITS_PER_WORD - VECTOR_LAYOUT_SHIFT as usize {
                return Self(
                    desc | (SUBTYPE_BITMAP << VECTOR_SUBTYPE_SHIFT)
                        | (window(elem_bitmap, 0) << VECTOR_LAYOUT_SHIFT),
                );
            }
        }
        let last = stats.first.map_or(0, |_| stats.last + 1);
        Self(DESC_COMPLEX_ARRAY | (alloc_complex_descriptor(elem_bitmap, last) << LOW_TYPE_BITS))
    }

    /// The raw descriptor word.
    #[must_use]
    pub const fn bits(self) -> usize {
        self.0
    }

    /// The encoding used.
    #[must_use]
    pub fn kind(self) -> DescriptorKind {
        match self.0 & TYPE_MASK {
            DESC_RUN_LENGTH => DescriptorKind::RunLength,
            DESC_SMALL_BITMAP => DescriptorKind::SmallBitmap,
            DESC_LARGE_BITMAP => DescriptorKind::LargeBitmap,
            DESC_COMPLEX => DescriptorKind::Complex,
            DESC_VECTOR => DescriptorKind::Vector,
            DESC_COMPLEX_ARRAY => DescriptorKind::ComplexArray,
            tag => gc_fatal!("corrupt descriptor {:#x} (tag {tag})", self.0),
        }
    }

    /// `true` if objects with this descriptor can never hold references.
    ///
    /// This is the common case and is checked before any decoding.
    #[inline]
    #[must_use]
    pub const fn is_ptr_free(self) -> bool {
        (self.0 & (TYPE_MASK | 0xffff_0000)) == DESC_RUN_LENGTH
            || (self.0 & TYPE_MASK == DESC_VECTOR
                && (self.0 >> VECTOR_SUBTYPE_SHIFT) & 0x3 == SUBTYPE_PTR_FREE)
            || self.0 == DESC_LARGE_BITMAP
    }

    /// `true` for array descriptors.
    #[must_use]
    pub const fn is_array(self) -> bool {
        matches!(self.0 & TYPE_MASK, DESC_VECTOR | DESC_COMPLEX_ARRAY)
    }

    /// Size in bytes stored in the descriptor, for the kinds that carry one.
    #[must_use]
    pub fn encoded_size(self) -> Option<usize> {
        match self.kind() {
            DescriptorKind::RunLength | DescriptorKind::SmallBitmap => Some(self.0 & SIZE_MASK),
            _ => None,
        }
    }

    /// Element size stored in a vector descriptor.
    #[must_use]
    pub fn element_size(self) -> Option<usize> {
        match self.kind() {
            DescriptorKind::Vector => Some((self.0 >> VECTOR_ELSIZE_SHIFT) & MAX_ELEMENT_SIZE),
            _ => None,
        }
    }

    /// Element layout of a vector descriptor.
    #[must_use]
    pub fn vector_subtype(self) -> Option<VectorSubtype> {
        match self.kind() {
            DescriptorKind::Vector => Some(match (self.0 >> VECTOR_SUBTYPE_SHIFT) & 0x3 {
                SUBTYPE_PTR_FREE => VectorSubtype::PtrFree,
                SUBTYPE_REFS => VectorSubtype::Refs,
                SUBTYPE_RUN_LENGTH => VectorSubtype::RunLength,
                _ => VectorSubtype::Bitmap,
            }),
            _ => None,
        }
    }

    pub(crate) const fn payload(self) -> usize {
        self.0 >> LOW_TYPE_BITS
    }

    pub(crate) const fn run(self) -> (usize, usize) {
        ((self.0 >> 16) & 0xff, (self.0 >> 24) & 0xff)
    }

    pub(crate) const fn small_bitmap(self) -> usize {
        self.0 >> SMALL_BITMAP_SHIFT
    }

    pub(crate) const fn vector_layout(self) -> usize {
        self.0 >> VECTOR_LAYOUT_SHIFT
    }

    /// The reference bitmap this descriptor encodes, with bit 0 at the first
    /// header word for objects and at the first element word for arrays.
    #[must_use]
    pub fn bitmap(self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut set = |bit: usize| {
            let word = bit / BITS_PER_WORD;
            if out.len() <= word {
                out.resize(word + 1, 0);
            }
            out[word] |= 1 << (bit % BITS_PER_WORD);
        };
        let mut set_bits = |bits: usize, offset: usize| {
            let mut bits = bits;
            while bits != 0 {
                set(offset + bits.trailing_zeros() as usize);
                bits &= bits - 1;
            }
        };
        match self.kind() {
            DescriptorKind::RunLength => {
                let (first, count) = self.run();
                for i in first..first + count {
                    set_bits(1, i);
                }
            }
            DescriptorKind::SmallBitmap => set_bits(self.small_bitmap(), HEADER_WORDS),
            DescriptorKind::LargeBitmap => set_bits(self.payload(), HEADER_WORDS),
            DescriptorKind::Complex | DescriptorKind::ComplexArray => {
                with_complex_bitmap(self.payload(), |words| {
                    for (i, &w) in words.iter().enumerate() {
                        set_bits(w, i * BITS_PER_WORD);
                    }
                });
            }
            DescriptorKind::Vector => match self.vector_subtype() {
                Some(VectorSubtype::Refs) => {
                    let words = self.element_size().unwrap_or(0) / WORD_SIZE;
                    for i in 0..words {
                        set_bits(1, i);
                    }
                }
                Some(VectorSubtype::RunLength) => {
                    let layout = self.vector_layout();
                    let (first, count) = (layout & 0xff, (layout >> 8) & 0xff);
                    for i in first..first + count {
                        set_bits(1, i);
                    }
                }
                Some(VectorSubtype::Bitmap) => set_bits(self.vector_layout(), 0),
                _ => {}
            },
        }
        if out.is_empty() {
            out.push(0);
        }
        out
    }
}

// ============================================================================
// Root descriptors
// ============================================================================

/// Mark callback for a user-described root range.
///
/// Called with the start of the registered range; must report every slot that
/// holds a reference.
pub type UserMarkFn = fn(start: *mut usize, mark: &mut dyn FnMut(*mut usize));

/// How the collector finds references inside a registered root range.
#[derive(Clone, Copy)]
pub enum RootDescriptor {
    /// Every word may be a reference; referenced objects are pinned.
    Conservative,
    /// Bit `i` marks word `i` as a precise reference slot.
    Bitmap(usize),
    /// Side-table bitmap for ranges longer than one word of bits.
    Complex(usize),
    /// A caller-supplied mark routine.
    User(UserMarkFn),
}

impl std::fmt::Debug for RootDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservative => f.write_str("Conservative"),
            Self::Bitmap(bits) => write!(f, "Bitmap({bits:#x})"),
            Self::Complex(index) => write!(f, "Complex({index})"),
            Self::User(_) => f.write_str("User(..)"),
        }
    }
}

impl RootDescriptor {
    /// Precise descriptor from a bitmap of `numbits` bits.
    #[must_use]
    pub fn bitmap(bitmap: &[usize], numbits: usize) -> Self {
        if numbits <= BITS_PER_WORD {
            let mask = if numbits == BITS_PER_WORD {
                usize::MAX
            } else {
                (1 << numbits) - 1
            };
            Self::Bitmap(bitmap.first().copied().unwrap_or(0) & mask)
        } else {
            Self::Complex(alloc_complex_descriptor(bitmap, numbits))
        }
    }

    /// Precise descriptor where all `words` words are references.
    #[must_use]
    pub fn all_refs(words: usize) -> Self {
        let full = words / BITS_PER_WORD;
        let mut bitmap = vec![usize::MAX; full];
        if words % BITS_PER_WORD != 0 {
            bitmap.push((1 << (words % BITS_PER_WORD)) - 1);
        }
        Self::bitmap(&bitmap, words)
    }

    /// `true` for ranges whose referents must be pinned.
    #[must_use]
    pub const fn is_conservative(&self) -> bool {
        matches!(self, Self::Conservative)
    }
}
