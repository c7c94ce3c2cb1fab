use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl DecodedImage {
    pub fn extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }
}

pub fn encode(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(bytes))
}

/// Encodes bytes whose type is unknown, sniffing the format from magic numbers.
pub fn encode_sniffed(bytes: &[u8]) -> String {
    encode(bytes, sniff_mime(bytes).unwrap_or("image/png"))
}

/// Bare base64 payloads (no `data:` prefix) are accepted and sniffed.
pub fn decode(raw: &str) -> Result<DecodedImage> {
    let raw = raw.trim();
    let Some(rest) = raw.strip_prefix("data:") else {
        let bytes = BASE64
            .decode(raw)
            .context("image payload is neither a data URI nor base64")?;
        let mime_type = sniff_mime(&bytes).unwrap_or("image/png").to_string();
        return Ok(DecodedImage { mime_type, bytes });
    };
    let Some((header, payload)) = rest.split_once(',') else {
        bail!("invalid data URI: missing ',' separator");
    };
    let Some(mime_type) = header.strip_suffix(";base64") else {
        bail!("invalid data URI: only base64 payloads are supported");
    };
    let bytes = BASE64
        .decode(payload.trim())
        .context("invalid data URI: payload is not base64")?;
    let mime_type = if mime_type.trim().is_empty() {
        sniff_mime(&bytes).unwrap_or("image/png").to_string()
    } else {
        mime_type.trim().to_ascii_lowercase()
    };
    Ok(DecodedImage { mime_type, bytes })
}

pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"GIF8") {
        return Some("image/gif");
    }
    None
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let lowered = mime_type.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("gif") {
        return "gif";
    }
    "png"
}

#[cfg(test)]
mod tests {
    use super::{decode, encode, encode_sniffed, extension_for_mime, sniff_mime};

    const PNG_HEADER: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn decode_reads_mime_and_payload() -> anyhow::Result<()> {
        let uri = encode(&[0xFF, 0xD8, 0xFF, 0x00], "image/jpeg");
        let decoded = decode(&uri)?;
        assert_eq!(decoded.mime_type, "image/jpeg");
        assert_eq!(decoded.bytes, vec![0xFF, 0xD8, 0xFF, 0x00]);
        assert_eq!(decoded.extension(), "jpg");
        Ok(())
    }

    #[test]
    fn bare_base64_is_sniffed() -> anyhow::Result<()> {
        let uri = encode_sniffed(&PNG_HEADER);
        assert!(uri.starts_with("data:image/png;base64,"));
        let bare = uri.trim_start_matches("data:image/png;base64,");
        assert_eq!(decode(bare)?.mime_type, "image/png");
        Ok(())
    }

    #[test]
    fn malformed_uris_are_rejected() {
        assert!(decode("data:image/png;base64").is_err());
        assert!(decode("data:image/png,plain").is_err());
        assert!(decode("data:image/png;base64,@@@").is_err());
    }

    #[test]
    fn mime_helpers_cover_common_formats() {
        assert_eq!(sniff_mime(b"GIF89a"), Some("image/gif"));
        assert_eq!(sniff_mime(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_mime(b"nope"), None);
        assert_eq!(extension_for_mime("image/webp"), "webp");
        assert_eq!(extension_for_mime("application/octet-stream"), "png");
    }
}
