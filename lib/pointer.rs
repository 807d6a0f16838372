//! Decoders for on-disk content-pointer encodings.
//!
//! Two encodings are recognized: small text pointer files and
//! symlinks whose target embeds the content key. Anything malformed
//! means "not a pointer" and is reported as `None`, never as an
//! error, so ordinary files pass through untouched.

/// First line of every pointer file, including the terminating newline.
pub const LFS_MAGIC: &str = "version https://git-lfs.github.com/spec/v1\n";

/// Pointer files are tiny; anything larger cannot be one.
pub const MAX_POINTER_SIZE: u64 = 1024;

/// Path segment that marks a symlink target as a keyed object.
pub const ANNEX_MARKER: &str = ".git/annex/objects/";

/// A decoded content descriptor: what the stub stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    /// Digest algorithm, e.g. `sha256`.
    pub hash_algo: String,
    /// Hex content digest.
    pub oid: String,
    /// True size of the content in bytes.
    pub size: u64,
}

impl Pointer {
    /// Decode a pointer file.
    ///
    /// The bytes must start with the exact magic line and continue as
    /// newline-terminated `key value` pairs carrying at least
    /// `oid <algo>:<digest>` and `size <decimal>`.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let rest = text.strip_prefix(LFS_MAGIC)?;
        if !rest.is_empty() && !rest.ends_with('\n') {
            return None;
        }

        let mut oid = None;
        let mut size = None;
        for line in rest.lines() {
            let (key, value) = line.split_once(' ')?;
            match key {
                "oid" => {
                    let (algo, digest) = value.split_once(':')?;
                    if algo.is_empty()
                        || digest.is_empty()
                        || !digest.bytes().all(|b| b.is_ascii_hexdigit())
                    {
                        return None;
                    }
                    oid = Some((algo.to_owned(), digest.to_owned()));
                }
                "size" => size = Some(value.parse::<u64>().ok()?),
                // Extra keys are allowed and ignored.
                _ => {}
            }
        }

        let (hash_algo, oid) = oid?;
        Some(Self {
            hash_algo,
            oid,
            size: size?,
        })
    }

    /// Render the canonical pointer text for this descriptor.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{LFS_MAGIC}oid {}:{}\nsize {}\n",
            self.hash_algo, self.oid, self.size
        )
    }
}

/// A content key decoded from a symlink target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnexKey {
    /// Digest algorithm as spelled in the key, e.g. `SHA256`.
    pub hash_algo: String,
    /// Content size in bytes.
    pub size: u64,
    /// Hex content digest.
    pub oid: String,
}

impl AnnexKey {
    /// Decode a key from a symlink target like
    /// `.git/annex/objects/ab/cd/SHA256-s100--deadbeef.txt`.
    ///
    /// The target must contain the object-store marker segment and its
    /// basename must follow `<algo>-s<size>--<digest>[.<ext>]`.
    #[must_use]
    pub fn decode_link_target(target: &str) -> Option<Self> {
        if !target.contains(ANNEX_MARKER) {
            return None;
        }

        let basename = target.rsplit('/').next()?;
        let key = match basename.split_once('.') {
            Some((key, _ext)) => key,
            None => basename,
        };

        let (prefix, digest) = key.split_once("--")?;
        let (algo, size_field) = prefix.split_once('-')?;
        let size = size_field.strip_prefix('s')?.parse::<u64>().ok()?;
        if algo.is_empty() || digest.is_empty() {
            return None;
        }

        Some(Self {
            hash_algo: algo.to_owned(),
            size,
            oid: digest.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_canonical_pointer() {
        let text = "version https://git-lfs.github.com/spec/v1\noid sha256:deadbeef\nsize 42\n";
        let pointer = Pointer::decode(text.as_bytes()).unwrap();
        assert_eq!(pointer.hash_algo, "sha256");
        assert_eq!(pointer.oid, "deadbeef");
        assert_eq!(pointer.size, 42);
    }

    #[test]
    fn decode_then_encode_round_trips() {
        let text = "version https://git-lfs.github.com/spec/v1\noid sha256:4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393\nsize 12345\n";
        let pointer = Pointer::decode(text.as_bytes()).unwrap();
        assert_eq!(pointer.encode(), text);
    }

    #[test]
    fn rejects_anything_without_the_magic_line() {
        for bytes in [
            &b""[..],
            b"hello world",
            b"version https://git-lfs.github.com/spec/v2\noid sha256:ab\nsize 1\n",
            b"Version https://git-lfs.github.com/spec/v1\noid sha256:ab\nsize 1\n",
            &[0xff, 0xfe, 0x00],
        ] {
            assert!(Pointer::decode(bytes).is_none());
        }
    }

    #[test]
    fn rejects_missing_or_malformed_fields() {
        let missing_size = "version https://git-lfs.github.com/spec/v1\noid sha256:abcd\n";
        assert!(Pointer::decode(missing_size.as_bytes()).is_none());

        let missing_oid = "version https://git-lfs.github.com/spec/v1\nsize 42\n";
        assert!(Pointer::decode(missing_oid.as_bytes()).is_none());

        let bad_digest = "version https://git-lfs.github.com/spec/v1\noid sha256:not-hex!\nsize 42\n";
        assert!(Pointer::decode(bad_digest.as_bytes()).is_none());

        let bad_size = "version https://git-lfs.github.com/spec/v1\noid sha256:abcd\nsize twelve\n";
        assert!(Pointer::decode(bad_size.as_bytes()).is_none());

        let unterminated = "version https://git-lfs.github.com/spec/v1\noid sha256:abcd\nsize 42";
        assert!(Pointer::decode(unterminated.as_bytes()).is_none());
    }

    #[test]
    fn ignores_unknown_keys() {
        let text = "version https://git-lfs.github.com/spec/v1\noid sha256:abcd\nsize 42\nx-custom hello\n";
        let pointer = Pointer::decode(text.as_bytes()).unwrap();
        assert_eq!(pointer.size, 42);
    }

    #[test]
    fn decodes_an_annex_link_target() {
        let key =
            AnnexKey::decode_link_target(".git/annex/objects/ab/cd/SHA256-s100--deadbeef.txt")
                .unwrap();
        assert_eq!(key.hash_algo, "SHA256");
        assert_eq!(key.size, 100);
        assert_eq!(key.oid, "deadbeef");
    }

    #[test]
    fn annex_extension_is_optional() {
        let key = AnnexKey::decode_link_target(
            "../../.git/annex/objects/xx/yy/SHA1-s7--0123abcd",
        )
        .unwrap();
        assert_eq!(key.hash_algo, "SHA1");
        assert_eq!(key.size, 7);
        assert_eq!(key.oid, "0123abcd");
    }

    #[test]
    fn rejects_targets_outside_the_object_store() {
        assert!(AnnexKey::decode_link_target("/usr/share/SHA256-s1--ab").is_none());
    }

    #[test]
    fn rejects_malformed_basenames() {
        for target in [
            ".git/annex/objects/ab/cd/SHA256-100--deadbeef",
            ".git/annex/objects/ab/cd/SHA256-s100-deadbeef",
            ".git/annex/objects/ab/cd/SHA256-sbig--deadbeef",
            ".git/annex/objects/ab/cd/-s100--deadbeef",
            ".git/annex/objects/ab/cd/SHA256-s100--",
        ] {
            assert!(
                AnnexKey::decode_link_target(target).is_none(),
                "{target} should not decode"
            );
        }
    }
}
