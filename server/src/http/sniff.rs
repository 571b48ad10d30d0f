//! Provides content type detection from the first bytes of a body

/// Number of bytes considered when sniffing
const SNIFF_LEN: usize = 512;

/// Default content type of HTML documents
const HTML: &str = "text/html; charset=utf-8";
/// Default content type of plain text
const TEXT: &str = "text/plain; charset=utf-8";
/// Default content type of unknown data
const BINARY: &str = "application/octet-stream";

/// Tags opening an HTML document, matched case-insensitively
///
/// A tag must be followed by a space or `>` to match.
const HTML_TAGS: [&[u8]; 17] = [
	b"<!DOCTYPE HTML",
	b"<HTML",
	b"<HEAD",
	b"<SCRIPT",
	b"<IFRAME",
	b"<H1",
	b"<DIV",
	b"<FONT",
	b"<TABLE",
	b"<A",
	b"<STYLE",
	b"<TITLE",
	b"<B",
	b"<BODY",
	b"<BR",
	b"<P",
	b"<!--",
];

/// Exact signatures, matched at the start of the data
const MAGIC: [(&[u8], &str); 11] = [
	(b"<?xml".as_slice(), "text/xml; charset=utf-8"),
	(b"%PDF-".as_slice(), "application/pdf"),
	(b"%!PS-Adobe-".as_slice(), "application/postscript"),
	(b"\xFE\xFF".as_slice(), "text/plain; charset=utf-16be"),
	(b"\xFF\xFE".as_slice(), "text/plain; charset=utf-16le"),
	(b"\xEF\xBB\xBF".as_slice(), TEXT),
	(b"\x89PNG\r\n\x1A\n".as_slice(), "image/png"),
	(b"GIF87a".as_slice(), "image/gif"),
	(b"GIF89a".as_slice(), "image/gif"),
	(b"\xFF\xD8\xFF".as_slice(), "image/jpeg"),
	(b"\x00asm".as_slice(), "application/wasm"),
];

/// Returns the content type of `data`
///
/// Follows the order of the WHATWG MIME sniffing standard for the types browsers care about,
/// falling back to plain text if `data` contains no binary control byte.
pub(crate) fn content_type(data: &[u8]) -> &'static str {
	let data = &data[..data.len().min(SNIFF_LEN)];

	let text = match data.iter().position(|b| !b.is_ascii_whitespace()) {
		Some(start) => &data[start..],
		None => &[],
	};
	let is_html = HTML_TAGS.iter().any(|tag| {
		text.len() > tag.len()
			&& text[..tag.len()].eq_ignore_ascii_case(tag)
			&& matches!(text[tag.len()], b' ' | b'>')
	});
	if is_html {
		return HTML;
	}
	if text.len() >= 5 && text[..5].eq_ignore_ascii_case(b"<?xml") {
		return MAGIC[0].1;
	}

	if let Some(&(_, content_type)) = MAGIC.iter().find(|(magic, _)| data.starts_with(magic)) {
		return content_type;
	}
	match data {
		[b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', b'V', b'P', ..] => "image/webp",
		[0x1F, 0x8B, 0x08, ..] => "application/x-gzip",
		[b'P', b'K', 0x03, 0x04, ..] => "application/zip",
		_ if data.iter().copied().any(is_binary) => BINARY,
		_ => TEXT,
	}
}

/// Returns whether `byte` never appears in text
#[inline]
const fn is_binary(byte: u8) -> bool {
	matches!(byte, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}
