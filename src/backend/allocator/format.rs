//! DRM format sets and format info tables
//!
//! A [`FormatSet`] maps a DRM fourcc to the ordered set of layout modifiers
//! a device or renderer accepts for it. It is the currency in which display
//! and render capabilities are expressed and negotiated.
//!
//! The module also provides small lookup tables, [`get_opaque`],
//! [`has_alpha`], [`get_bpp`] and [`get_depth`], for the formats this crate
//! handles.

use indexmap::{IndexMap, IndexSet};

use super::{Format, Fourcc, Modifier};

/// Macro to generate table lookup functions for formats.
macro_rules! format_tables {
    (
        $($fourcc: ident {
            $(opaque: $opaque: ident,)?
            alpha: $alpha: expr,
            bpp: $bpp: expr,
            depth: $depth: expr $(,)?
        }),* $(,)?
    ) => {
        /// Returns the opaque alternative of the specified format, if it has an alpha channel.
        pub const fn get_opaque(fourcc: Fourcc) -> Option<Fourcc> {
            match fourcc {
                $($(
                    Fourcc::$fourcc => Some(Fourcc::$opaque),
                )?)*
                _ => None,
            }
        }

        /// Returns true if the format has an alpha channel.
        ///
        /// Unknown formats always return `false`.
        pub const fn has_alpha(fourcc: Fourcc) -> bool {
            match fourcc {
                $(
                    Fourcc::$fourcc => $alpha,
                )*
                _ => false,
            }
        }

        /// Returns the bits per pixel of the specified format.
        pub const fn get_bpp(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        /// Returns the used bits per pixel of the specified format,
        /// excluding padding and unused "X" components.
        pub const fn get_depth(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($depth),)*
                _ => None,
            }
        }

        #[cfg(test)]
        fn _impl_formats() -> &'static [Fourcc] {
            &[
                $(
                    Fourcc::$fourcc,
                )*
            ]
        }
    };
}

format_tables! {
    R8 { alpha: false, bpp: 8, depth: 8 },
    Rgb565 { alpha: false, bpp: 16, depth: 16 },
    Argb8888 { opaque: Xrgb8888, alpha: true, bpp: 32, depth: 32 },
    Xrgb8888 { alpha: false, bpp: 32, depth: 24 },
    Abgr8888 { opaque: Xbgr8888, alpha: true, bpp: 32, depth: 32 },
    Xbgr8888 { alpha: false, bpp: 32, depth: 24 },
    Rgba8888 { opaque: Rgbx8888, alpha: true, bpp: 32, depth: 32 },
    Rgbx8888 { alpha: false, bpp: 32, depth: 24 },
    Bgra8888 { opaque: Bgrx8888, alpha: true, bpp: 32, depth: 32 },
    Bgrx8888 { alpha: false, bpp: 32, depth: 24 },
    Argb2101010 { opaque: Xrgb2101010, alpha: true, bpp: 32, depth: 32 },
    Xrgb2101010 { alpha: false, bpp: 32, depth: 30 },
    Abgr2101010 { opaque: Xbgr2101010, alpha: true, bpp: 32, depth: 32 },
    Xbgr2101010 { alpha: false, bpp: 32, depth: 30 },
    Abgr16161616 { opaque: Xbgr16161616, alpha: true, bpp: 64, depth: 64 },
    Xbgr16161616 { alpha: false, bpp: 64, depth: 48 },
    Abgr16161616f { opaque: Xbgr16161616f, alpha: true, bpp: 64, depth: 64 },
    Xbgr16161616f { alpha: false, bpp: 64, depth: 48 },
}

/// A set of formats, each with an ordered set of accepted modifiers
#[derive(Debug, Default, Clone)]
pub struct FormatSet {
    entries: IndexMap<Fourcc, IndexSet<Modifier>>,
}

impl FormatSet {
    /// Create an empty format set
    pub fn new() -> FormatSet {
        Default::default()
    }

    /// Add a fourcc/modifier pair to the set
    pub fn add(&mut self, format: Format) {
        self.entries.entry(format.code).or_default().insert(format.modifier);
    }

    /// Returns true if the set holds no formats at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if the exact fourcc/modifier pair is in the set
    pub fn contains(&self, format: &Format) -> bool {
        self.entries
            .get(&format.code)
            .map(|modifiers| modifiers.contains(&format.modifier))
            .unwrap_or(false)
    }

    /// Returns true if the fourcc is in the set with any modifier
    pub fn has(&self, fourcc: Fourcc) -> bool {
        self.entries.contains_key(&fourcc)
    }

    /// The modifiers accepted for a given fourcc, in insertion order
    pub fn modifiers(&self, fourcc: Fourcc) -> impl Iterator<Item = Modifier> + '_ {
        self.entries
            .get(&fourcc)
            .into_iter()
            .flat_map(|modifiers| modifiers.iter().copied())
    }

    /// Iterate over every fourcc/modifier pair of the set
    pub fn iter(&self) -> impl Iterator<Item = Format> + '_ {
        self.entries.iter().flat_map(|(&code, modifiers)| {
            modifiers.iter().map(move |&modifier| Format { code, modifier })
        })
    }

    /// The formats of the set, without their modifiers
    pub fn fourccs(&self) -> impl Iterator<Item = Fourcc> + '_ {
        self.entries.keys().copied()
    }

    /// Formats accepted by both sets
    ///
    /// A fourcc survives only if at least one modifier is accepted by both
    /// sides; intersecting with an empty set yields an empty set.
    pub fn intersect(&self, other: &FormatSet) -> FormatSet {
        let mut result = FormatSet::new();
        for (&code, modifiers) in &self.entries {
            let Some(other_modifiers) = other.entries.get(&code) else {
                continue;
            };
            for &modifier in modifiers {
                if other_modifiers.contains(&modifier) {
                    result.add(Format { code, modifier });
                }
            }
        }
        result
    }

    /// Formats accepted by either set
    pub fn union(&self, other: &FormatSet) -> FormatSet {
        let mut result = self.clone();
        for format in other.iter() {
            result.add(format);
        }
        result
    }

    /// A copy of this set without implicit-layout entries
    ///
    /// [`Modifier::Invalid`] stands for "the driver picks a layout"; that
    /// meaning is not portable between devices, so cross-GPU negotiation
    /// strips it.
    pub fn remove_implicit(&self) -> FormatSet {
        let mut result = FormatSet::new();
        for format in self.iter() {
            if format.modifier != Modifier::Invalid {
                result.add(format);
            }
        }
        result
    }
}

impl FromIterator<Format> for FormatSet {
    fn from_iter<T: IntoIterator<Item = Format>>(iter: T) -> Self {
        let mut set = FormatSet::new();
        for format in iter {
            set.add(format);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(code: Fourcc, modifier: Modifier) -> Format {
        Format { code, modifier }
    }

    #[test]
    fn intersection_requires_both_sides() {
        let a: FormatSet = [
            format(Fourcc::Argb8888, Modifier::Linear),
            format(Fourcc::Argb8888, Modifier::Invalid),
            format(Fourcc::Xrgb8888, Modifier::Linear),
        ]
        .into_iter()
        .collect();
        let b: FormatSet = [
            format(Fourcc::Argb8888, Modifier::Linear),
            format(Fourcc::Abgr8888, Modifier::Linear),
        ]
        .into_iter()
        .collect();

        let intersection = a.intersect(&b);
        assert!(intersection.contains(&format(Fourcc::Argb8888, Modifier::Linear)));
        assert!(!intersection.contains(&format(Fourcc::Argb8888, Modifier::Invalid)));
        assert!(!intersection.has(Fourcc::Xrgb8888));
        assert!(!intersection.has(Fourcc::Abgr8888));
    }

    #[test]
    fn intersection_with_empty_is_empty() {
        let a: FormatSet = [format(Fourcc::Argb8888, Modifier::Linear)].into_iter().collect();
        assert!(a.intersect(&FormatSet::new()).is_empty());
        assert!(FormatSet::new().intersect(&a).is_empty());
    }

    #[test]
    fn union_merges_modifier_lists() {
        let a: FormatSet = [format(Fourcc::Argb8888, Modifier::Linear)].into_iter().collect();
        let b: FormatSet = [format(Fourcc::Argb8888, Modifier::Invalid)].into_iter().collect();

        let union = a.union(&b);
        assert_eq!(union.modifiers(Fourcc::Argb8888).count(), 2);
    }

    #[test]
    fn remove_implicit_drops_invalid_only() {
        let set: FormatSet = [
            format(Fourcc::Argb8888, Modifier::Linear),
            format(Fourcc::Argb8888, Modifier::Invalid),
            format(Fourcc::Xrgb8888, Modifier::Invalid),
        ]
        .into_iter()
        .collect();

        let explicit = set.remove_implicit();
        assert!(explicit.contains(&format(Fourcc::Argb8888, Modifier::Linear)));
        assert!(!explicit.contains(&format(Fourcc::Argb8888, Modifier::Invalid)));
        assert!(!explicit.has(Fourcc::Xrgb8888));
    }

    #[test]
    fn opaque_tables_are_consistent() {
        for &fourcc in _impl_formats() {
            if let Some(opaque) = get_opaque(fourcc) {
                assert!(has_alpha(fourcc), "{fourcc} has an opaque variant but no alpha");
                assert!(!has_alpha(opaque), "opaque variant {opaque} claims alpha");
                assert_eq!(get_bpp(fourcc), get_bpp(opaque));
            }
            assert!(get_depth(fourcc) <= get_bpp(fourcc));
        }
    }
}
