use quick_xml::events::{attributes::AttrError, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Error as QuickXmlError, Reader, Writer};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
const RES_XML_CDATA_TYPE: u16 = 0x0104;

const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;

/// URI bound to the `android:` prefix in every manifest.
pub const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";
pub const ANDROID_NAMESPACE_PREFIX: &str = "android";

const TYPE_NULL: u8 = 0x00;
const TYPE_REFERENCE: u8 = 0x01;
const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const TYPE_INT_BOOLEAN: u8 = 0x12;

/// Framework resource ids (`android.R.attr.*`) for the attributes the patcher writes.
const ANDROID_ATTRIBUTE_IDS: &[(&str, u32)] = &[
    ("name", 0x0101_0003),
    ("enabled", 0x0101_000e),
    ("exported", 0x0101_0010),
    ("targetPackage", 0x0101_0021),
    ("maxSdkVersion", 0x0101_0271),
];

/// Look up the framework resource id of a well-known `android:` attribute.
pub fn android_attribute_id(name: &str) -> Option<u32> {
    ANDROID_ATTRIBUTE_IDS
        .iter()
        .find(|(attr, _)| *attr == name)
        .map(|(_, id)| *id)
}

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    chunk_size: u32,
    start: usize,
}

impl ChunkHeader {
    fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }
}

struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> BinaryXmlResult<u8> {
        if self.pos + 1 > self.data.len() {
            return Err(malformed("Unexpected end of binary XML"));
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> BinaryXmlResult<u16> {
        if self.pos + 2 > self.data.len() {
            return Err(malformed("Unexpected end of binary XML"));
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> BinaryXmlResult<u32> {
        if self.pos + 4 > self.data.len() {
            return Err(malformed("Unexpected end of binary XML"));
        }
        let value = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    fn seek(&mut self, offset: usize) -> BinaryXmlResult<()> {
        if offset > self.data.len() {
            return Err(malformed("Attempted to seek past end of document"));
        }
        self.pos = offset;
        Ok(())
    }
}

fn malformed(msg: impl Into<String>) -> BinaryXmlError {
    BinaryXmlError::MalformedDocument(msg.into())
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn parse(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> BinaryXmlResult<Self> {
        let string_count = reader.read_u32()? as usize;
        let style_count = reader.read_u32()? as usize;
        let flags = reader.read_u32()?;
        let strings_start = reader.read_u32()? as usize;
        let _styles_start = reader.read_u32()?;

        let is_utf8 = (flags & STRING_FLAG_UTF8) != 0;

        let mut string_offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            string_offsets.push(reader.read_u32()? as usize);
        }

        for _ in 0..style_count {
            reader.read_u32()?; // style offsets are not kept
        }

        let strings_base = header.start + strings_start;
        let chunk_end = header.end();

        let mut strings = Vec::with_capacity(string_count);
        for offset in string_offsets {
            let absolute = strings_base + offset;
            let text = if is_utf8 {
                read_utf8_string(reader.data, absolute, chunk_end)?
            } else {
                read_utf16_string(reader.data, absolute, chunk_end)?
            };
            strings.push(text);
        }

        Ok(StringPool { strings })
    }

    fn get(&self, idx: u32) -> Option<&str> {
        if idx == NO_ENTRY_INDEX {
            return None;
        }
        self.strings.get(idx as usize).map(|s| s.as_str())
    }
}

#[derive(Clone, Debug)]
struct NamespaceFrame {
    prefix: Option<String>,
    uri: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct NamespaceDecl {
    prefix: String,
    uri: String,
}

#[derive(Clone, Debug)]
struct PendingAttribute {
    prefix: Option<String>,
    local_name: String,
    value: String,
}

struct StringPoolBuilder {
    strings: Vec<String>,
    indices: BTreeMap<String, u32>,
}

impl StringPoolBuilder {
    fn new() -> Self {
        StringPoolBuilder {
            strings: Vec::new(),
            indices: BTreeMap::new(),
        }
    }

    fn intern(&mut self, value: impl AsRef<str>) -> u32 {
        self.intern_cow(Cow::Borrowed(value.as_ref()))
    }

    fn intern_cow(&mut self, value: Cow<'_, str>) -> u32 {
        if let Some(&idx) = self.indices.get(value.as_ref()) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        let owned = value.into_owned();
        self.strings.push(owned.clone());
        self.indices.insert(owned, idx);
        idx
    }

    fn index_of(&self, value: &str) -> Option<u32> {
        self.indices.get(value).copied()
    }

    fn to_chunk(&self) -> Vec<u8> {
        let string_count = self.strings.len() as u32;
        let header_size = 28u16;
        let strings_start = header_size as u32 + string_count * 4;
        let mut string_data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for s in &self.strings {
            offsets.push(string_data.len() as u32);
            write_utf16_string(&mut string_data, s);
        }
        align_to_four(&mut string_data);

        let mut chunk = Vec::new();
        write_u16(&mut chunk, RES_STRING_POOL_TYPE);
        write_u16(&mut chunk, header_size);
        write_u32(&mut chunk, 0); // chunk size placeholder
        write_u32(&mut chunk, string_count);
        write_u32(&mut chunk, 0); // style count
        write_u32(&mut chunk, 0); // flags (UTF-16)
        write_u32(&mut chunk, strings_start);
        write_u32(&mut chunk, 0); // stylesStart
        for offset in offsets {
            write_u32(&mut chunk, offset);
        }
        chunk.extend_from_slice(&string_data);
        align_to_four(&mut chunk);
        let chunk_size = chunk.len() as u32;
        chunk[4..8].copy_from_slice(&chunk_size.to_le_bytes());
        chunk
    }
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<String> {
    let mut cursor = offset;
    if cursor >= limit {
        return Err(malformed("String offset exceeds chunk bounds"));
    }
    // UTF-16 length first, then the UTF-8 byte length we actually need.
    let (_, len_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += len_bytes;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len > limit {
        return Err(malformed("UTF-8 string exceeds chunk bounds"));
    }
    let slice = &data[cursor..cursor + byte_len];
    let text = std::str::from_utf8(slice).map_err(|err| malformed(err.to_string()))?;
    cursor += byte_len;
    if cursor >= limit {
        return Err(malformed("Missing UTF-8 terminator"));
    }
    Ok(text.to_string())
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<String> {
    let mut cursor = offset;
    let (char_count, header_bytes) = read_utf16_length(data, cursor, limit)?;
    cursor += header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len > limit {
        return Err(malformed("UTF-16 string exceeds chunk bounds"));
    }
    let units: Vec<u16> = data[cursor..cursor + byte_len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    cursor += byte_len;
    if cursor + 2 > limit {
        return Err(malformed("Missing UTF-16 terminator"));
    }
    if u16::from_le_bytes([data[cursor], data[cursor + 1]]) != 0 {
        return Err(malformed("UTF-16 string missing terminator"));
    }
    String::from_utf16(&units).map_err(|err| malformed(err.to_string()))
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<(usize, usize)> {
    if offset >= limit {
        return Err(malformed("Invalid UTF-8 length offset"));
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            return Err(malformed("Truncated UTF-8 length"));
        }
        let second = data[offset + 1];
        let length = (((first & 0x7F) as usize) << 8) | second as usize;
        Ok((length, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<(usize, usize)> {
    if offset + 2 > limit {
        return Err(malformed("Invalid UTF-16 length offset"));
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            return Err(malformed("Truncated UTF-16 length"));
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        let length = (((first & 0x7FFF) as usize) << 16) | second as usize;
        Ok((length, 4))
    }
}

fn read_chunk_header(reader: &mut BinaryReader<'_>) -> BinaryXmlResult<ChunkHeader> {
    let start = reader.position();
    if reader.remaining() < 8 {
        return Err(malformed("Truncated binary XML chunk header"));
    }
    let chunk_type = reader.read_u16()?;
    let header_size = reader.read_u16()?;
    let chunk_size = reader.read_u32()?;
    if chunk_size < header_size as u32 || header_size < 8 {
        return Err(malformed("Invalid chunk sizing in binary XML"));
    }
    let end = start
        .checked_add(chunk_size as usize)
        .ok_or_else(|| malformed("Chunk size overflow"))?;
    if end > reader.data.len() {
        return Err(malformed("Chunk extends past end of document"));
    }
    Ok(ChunkHeader {
        chunk_type,
        header_size,
        chunk_size,
        start,
    })
}

fn resolve_prefix(namespaces: &[NamespaceFrame], uri: Option<&str>) -> Option<String> {
    uri.and_then(|target| {
        namespaces
            .iter()
            .rev()
            .find(|frame| frame.uri.as_deref() == Some(target))
            .and_then(|frame| frame.prefix.clone())
    })
}

fn decode_value(
    strings: &StringPool,
    raw_value_idx: u32,
    data_type: u8,
    data: u32,
) -> BinaryXmlResult<ManifestValue> {
    match data_type {
        TYPE_STRING => strings
            .get(data)
            .or_else(|| strings.get(raw_value_idx))
            .map(|s| ManifestValue::String(s.to_string()))
            .ok_or_else(|| malformed("String value references missing pool entry")),
        // `@null` (data 0) and `@empty` (data 1) stay typed so they re-encode unchanged.
        TYPE_NULL => Ok(ManifestValue::Raw {
            data_type: TYPE_NULL,
            data,
        }),
        TYPE_REFERENCE => Ok(ManifestValue::Reference(data)),
        TYPE_INT_BOOLEAN => Ok(ManifestValue::Boolean(data != 0)),
        TYPE_INT_DEC => Ok(ManifestValue::Integer(i64::from(data as i32))),
        TYPE_INT_HEX => Ok(ManifestValue::Hex(data)),
        other => Ok(ManifestValue::Raw {
            data_type: other,
            data,
        }),
    }
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

fn write_utf16_string(buf: &mut Vec<u8>, text: &str) {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = units.len();
    if len < 0x8000 {
        write_u16(buf, len as u16);
    } else {
        let first = 0x8000 | ((len >> 16) as u16 & 0x7FFF);
        let second = (len & 0xFFFF) as u16;
        write_u16(buf, first);
        write_u16(buf, second);
    }
    for unit in units {
        write_u16(buf, unit);
    }
    write_u16(buf, 0);
}

fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Only string values keep their raw text in the binary form, as aapt2 does.
fn raw_value_text(value: &ManifestValue) -> Option<&str> {
    match value {
        ManifestValue::String(text) => Some(text),
        _ => None,
    }
}

fn manifest_value_to_text(value: &ManifestValue) -> String {
    match value {
        ManifestValue::String(text) => text.clone(),
        ManifestValue::Boolean(flag) => flag.to_string(),
        ManifestValue::Integer(num) => num.to_string(),
        ManifestValue::Hex(value) => format!("0x{value:x}"),
        ManifestValue::Reference(id) => format!("@0x{id:08x}"),
        ManifestValue::Raw { data_type, data } => format!("#{data_type:02x}:{data:08x}"),
    }
}

fn parse_manifest_value(text: &str) -> ManifestValue {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        ManifestValue::Boolean(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        ManifestValue::Boolean(false)
    } else if let Some(hex) = trimmed.strip_prefix("@0x").or_else(|| trimmed.strip_prefix("@0X")) {
        match u32::from_str_radix(hex, 16) {
            Ok(value) => ManifestValue::Reference(value),
            Err(_) => ManifestValue::String(trimmed.to_string()),
        }
    } else if let Some(raw) = trimmed.strip_prefix('#').and_then(parse_raw_value) {
        raw
    } else if let Some(value) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        match u32::from_str_radix(value, 16) {
            Ok(number) => ManifestValue::Hex(number),
            Err(_) => ManifestValue::String(trimmed.to_string()),
        }
    } else if let Ok(number) = trimmed.parse::<i64>() {
        ManifestValue::Integer(number)
    } else {
        ManifestValue::String(trimmed.to_string())
    }
}

fn parse_raw_value(text: &str) -> Option<ManifestValue> {
    let (data_type, data) = text.split_once(':')?;
    if data_type.len() != 2 || data.len() != 8 {
        return None;
    }
    Some(ManifestValue::Raw {
        data_type: u8::from_str_radix(data_type, 16).ok()?,
        data: u32::from_str_radix(data, 16).ok()?,
    })
}

fn begin_chunk(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    write_u16(buf, chunk_type);
    write_u16(buf, header_size);
    write_u32(buf, 0); // placeholder for chunk size
    start
}

fn finalize_chunk(buf: &mut Vec<u8>, chunk_start: usize) {
    align_to_four(buf);
    let size = (buf.len() - chunk_start) as u32;
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size.to_le_bytes());
}

/// Result alias for binary XML operations.
pub type BinaryXmlResult<T> = Result<T, BinaryXmlError>;

/// Errors surfaced by the binary XML codec.
#[derive(Debug, thiserror::Error)]
pub enum BinaryXmlError {
    /// The document does not follow the chunk layout.
    #[error("Malformed manifest: {0}")]
    MalformedDocument(String),
    /// Text XML parsing/generation failure.
    #[error("XML error: {0}")]
    Xml(String),
}

impl From<QuickXmlError> for BinaryXmlError {
    fn from(value: QuickXmlError) -> Self {
        BinaryXmlError::Xml(value.to_string())
    }
}

impl From<AttrError> for BinaryXmlError {
    fn from(value: AttrError) -> Self {
        BinaryXmlError::Xml(value.to_string())
    }
}

/// Typed attribute values inside the manifest DOM representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestValue {
    String(String),
    Boolean(bool),
    Integer(i64),
    Hex(u32),
    Reference(u32),
    /// Any other typed value (float, dimension, color...), kept bit-exact.
    Raw { data_type: u8, data: u32 },
}

impl ManifestValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ManifestValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl From<String> for ManifestValue {
    fn from(value: String) -> Self {
        ManifestValue::String(value)
    }
}

impl From<&str> for ManifestValue {
    fn from(value: &str) -> Self {
        ManifestValue::String(value.to_owned())
    }
}

impl From<bool> for ManifestValue {
    fn from(value: bool) -> Self {
        ManifestValue::Boolean(value)
    }
}

impl From<i64> for ManifestValue {
    fn from(value: i64) -> Self {
        ManifestValue::Integer(value)
    }
}

/// A single attribute attached to a manifest element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestAttribute {
    pub namespace_prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub resource_id: Option<u32>,
    pub name: String,
    pub value: ManifestValue,
}

impl ManifestAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<ManifestValue>) -> Self {
        ManifestAttribute {
            namespace_prefix: None,
            namespace_uri: None,
            resource_id: None,
            name: name.into(),
            value: value.into(),
        }
    }

    /// An `android:`-namespaced attribute, carrying its framework resource id when known.
    pub fn android(name: impl Into<String>, value: impl Into<ManifestValue>) -> Self {
        let name = name.into();
        ManifestAttribute {
            namespace_prefix: Some(ANDROID_NAMESPACE_PREFIX.to_string()),
            namespace_uri: Some(ANDROID_NAMESPACE_URI.to_string()),
            resource_id: android_attribute_id(&name),
            name,
            value: value.into(),
        }
    }

    /// True for `android:<local>`, matched by namespace URI or, failing that, by prefix.
    pub fn is_android(&self, local: &str) -> bool {
        if self.name != local {
            return false;
        }
        match &self.namespace_uri {
            Some(uri) => uri == ANDROID_NAMESPACE_URI,
            None => self.namespace_prefix.as_deref() == Some(ANDROID_NAMESPACE_PREFIX),
        }
    }
}

/// DOM-style element node for the binary XML tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestElement {
    pub namespace_prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub tag: String,
    pub attributes: Vec<ManifestAttribute>,
    pub children: Vec<ManifestElement>,
    pub text: Option<String>,
}

impl ManifestElement {
    pub fn new(tag: impl Into<String>) -> Self {
        ManifestElement {
            namespace_prefix: None,
            namespace_uri: None,
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    /// Attribute lookup by `prefix:local` or bare `local` (no namespace).
    pub fn attribute_value(&self, name: &str) -> Option<&ManifestValue> {
        let (namespace, local) = split_attribute_query(name);
        self.attributes
            .iter()
            .find(|attr| attr.name == local && attr.namespace_prefix.as_deref() == namespace)
            .map(|attr| &attr.value)
    }

    /// Remove every `android:<local>` attribute; returns how many were dropped.
    pub fn remove_android_attribute(&mut self, local: &str) -> usize {
        let before = self.attributes.len();
        self.attributes.retain(|attr| !attr.is_android(local));
        before - self.attributes.len()
    }

    pub fn append_child(&mut self, child: ManifestElement) {
        self.children.push(child);
    }

    pub fn find_child(&self, tag: &str) -> Option<&ManifestElement> {
        self.children.iter().find(|child| child.tag == tag)
    }

    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a ManifestElement> {
        self.children.iter().filter(move |child| child.tag == tag)
    }
}

fn split_attribute_query(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((ns, local)) => (Some(ns), local),
        None => (None, name),
    }
}

fn qualified_name(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{local}"),
        None => local.to_string(),
    }
}

fn collect_namespace_declarations(root: &ManifestElement) -> Vec<NamespaceDecl> {
    let mut set = BTreeSet::new();
    gather_namespace_decls(root, &mut set);
    set.into_iter().collect()
}

fn gather_namespace_decls(element: &ManifestElement, set: &mut BTreeSet<NamespaceDecl>) {
    if let (Some(prefix), Some(uri)) = (&element.namespace_prefix, &element.namespace_uri) {
        set.insert(NamespaceDecl {
            prefix: prefix.clone(),
            uri: uri.clone(),
        });
    }
    for attr in &element.attributes {
        if let (Some(prefix), Some(uri)) = (&attr.namespace_prefix, &attr.namespace_uri) {
            set.insert(NamespaceDecl {
                prefix: prefix.clone(),
                uri: uri.clone(),
            });
        }
    }
    for child in &element.children {
        gather_namespace_decls(child, set);
    }
}

/// Every distinct (resource id, attribute name) pair in the tree, ordered by id.
fn collect_resource_attributes(element: &ManifestElement, out: &mut BTreeSet<(u32, String)>) {
    for attr in &element.attributes {
        if let Some(id) = attr.resource_id {
            out.insert((id, attr.name.clone()));
        }
    }
    for child in &element.children {
        collect_resource_attributes(child, out);
    }
}

fn collect_element_strings(element: &ManifestElement, pool: &mut StringPoolBuilder) {
    pool.intern(&element.tag);
    if let Some(prefix) = &element.namespace_prefix {
        pool.intern(prefix);
    }
    if let Some(uri) = &element.namespace_uri {
        pool.intern(uri);
    }
    if let Some(text) = &element.text {
        pool.intern(text);
    }
    for attr in &element.attributes {
        pool.intern(&attr.name);
        if let Some(prefix) = &attr.namespace_prefix {
            pool.intern(prefix);
        }
        if let Some(uri) = &attr.namespace_uri {
            pool.intern(uri);
        }
        if let Some(raw) = raw_value_text(&attr.value) {
            pool.intern(raw);
        }
    }
    for child in &element.children {
        collect_element_strings(child, pool);
    }
}

fn attach_element(
    stack: &mut Vec<ManifestElement>,
    root: &mut Option<ManifestElement>,
    element: ManifestElement,
) -> BinaryXmlResult<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    } else {
        return Err(malformed("Multiple root elements in manifest"));
    }
    Ok(())
}

fn parse_text_content(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lookup_namespace_uri(
    stack: &[BTreeMap<String, String>],
    prefix: Option<&str>,
) -> Option<String> {
    let key = prefix.unwrap_or("");
    stack.iter().rev().find_map(|frame| frame.get(key).cloned())
}

fn split_qname_owned(name: &str) -> (Option<String>, String) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, name.to_string()),
    }
}

fn extract_attributes(
    start: &BytesStart<'_>,
) -> BinaryXmlResult<(BTreeMap<String, String>, Vec<PendingAttribute>)> {
    let mut namespaces = BTreeMap::new();
    let mut attrs = Vec::new();
    for attr in start.attributes().with_checks(false) {
        let attr = attr?;
        let key =
            std::str::from_utf8(attr.key.as_ref()).map_err(|err| malformed(err.to_string()))?;
        let value = attr.unescape_value()?.into_owned();
        if key == "xmlns" {
            namespaces.insert(String::new(), value);
            continue;
        } else if let Some(rest) = key.strip_prefix("xmlns:") {
            namespaces.insert(rest.to_string(), value);
            continue;
        }
        let (prefix, local_name) = split_qname_owned(key);
        attrs.push(PendingAttribute {
            prefix,
            local_name,
            value,
        });
    }
    Ok((namespaces, attrs))
}

fn build_element_from_start(
    start: &BytesStart<'_>,
    ns_stack: &[BTreeMap<String, String>],
    attrs: Vec<PendingAttribute>,
) -> BinaryXmlResult<ManifestElement> {
    let name_ref = start.name();
    let raw_name =
        std::str::from_utf8(name_ref.as_ref()).map_err(|err| malformed(err.to_string()))?;
    let (prefix, local) = split_qname_owned(raw_name);
    let namespace_uri = match prefix.as_deref() {
        Some(prefix) => lookup_namespace_uri(ns_stack, Some(prefix)),
        None => None,
    };
    let mut element = ManifestElement::new(local);
    element.namespace_prefix = prefix;
    element.namespace_uri = namespace_uri;
    element.attributes = attrs
        .into_iter()
        .map(|attr| build_manifest_attribute(attr, ns_stack))
        .collect();
    Ok(element)
}

fn build_manifest_attribute(
    attr: PendingAttribute,
    ns_stack: &[BTreeMap<String, String>],
) -> ManifestAttribute {
    let namespace_uri = attr
        .prefix
        .as_deref()
        .and_then(|prefix| lookup_namespace_uri(ns_stack, Some(prefix)));
    let resource_id = if namespace_uri.as_deref() == Some(ANDROID_NAMESPACE_URI) {
        android_attribute_id(&attr.local_name)
    } else {
        None
    };
    ManifestAttribute {
        namespace_prefix: attr.prefix,
        namespace_uri,
        resource_id,
        name: attr.local_name,
        value: parse_manifest_value(&attr.value),
    }
}

fn write_resource_map(buf: &mut Vec<u8>, ids: &[u32]) {
    let chunk_start = begin_chunk(buf, RES_XML_RESOURCE_MAP_TYPE, 8);
    for id in ids {
        write_u32(buf, *id);
    }
    finalize_chunk(buf, chunk_start);
}

fn write_namespace_chunk(
    buf: &mut Vec<u8>,
    pool: &StringPoolBuilder,
    decl: &NamespaceDecl,
    is_start: bool,
) -> BinaryXmlResult<()> {
    let chunk_type = if is_start {
        RES_XML_START_NAMESPACE_TYPE
    } else {
        RES_XML_END_NAMESPACE_TYPE
    };
    let chunk_start = begin_chunk(buf, chunk_type, 16);
    write_u32(buf, 0);
    write_u32(buf, NO_ENTRY_INDEX);
    let prefix_idx = pool
        .index_of(&decl.prefix)
        .ok_or_else(|| malformed("Missing namespace prefix string"))?;
    let uri_idx = pool
        .index_of(&decl.uri)
        .ok_or_else(|| malformed("Missing namespace URI string"))?;
    write_u32(buf, prefix_idx);
    write_u32(buf, uri_idx);
    finalize_chunk(buf, chunk_start);
    Ok(())
}

fn write_element_recursive(
    element: &ManifestElement,
    buf: &mut Vec<u8>,
    pool: &StringPoolBuilder,
) -> BinaryXmlResult<()> {
    write_start_element(buf, element, pool)?;
    if let Some(text) = &element.text {
        write_cdata(buf, text, pool)?;
    }
    for child in &element.children {
        write_element_recursive(child, buf, pool)?;
    }
    write_end_element(buf, element, pool)?;
    Ok(())
}

fn element_name_indices(
    element: &ManifestElement,
    pool: &StringPoolBuilder,
) -> BinaryXmlResult<(u32, u32)> {
    let ns_idx = match &element.namespace_uri {
        Some(uri) => pool
            .index_of(uri)
            .ok_or_else(|| malformed("Missing element namespace URI string"))?,
        None => NO_ENTRY_INDEX,
    };
    let name_idx = pool
        .index_of(&element.tag)
        .ok_or_else(|| malformed("Missing element tag string"))?;
    Ok((ns_idx, name_idx))
}

fn write_start_element(
    buf: &mut Vec<u8>,
    element: &ManifestElement,
    pool: &StringPoolBuilder,
) -> BinaryXmlResult<()> {
    let (ns_idx, name_idx) = element_name_indices(element, pool)?;
    // The framework resolves attributes assuming ascending resource ids.
    let mut ordered: Vec<&ManifestAttribute> = element.attributes.iter().collect();
    ordered.sort_by_key(|attr| attr.resource_id.unwrap_or(u32::MAX));

    let chunk_start = begin_chunk(buf, RES_XML_START_ELEMENT_TYPE, 16);
    write_u32(buf, 0);
    write_u32(buf, NO_ENTRY_INDEX);
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    write_u16(buf, 20); // attributeStart
    write_u16(buf, 20); // attributeSize
    write_u16(buf, ordered.len() as u16);
    write_u16(buf, 0); // idIndex
    write_u16(buf, 0); // classIndex
    write_u16(buf, 0); // styleIndex
    for attr in ordered {
        write_attribute(buf, attr, pool)?;
    }
    finalize_chunk(buf, chunk_start);
    Ok(())
}

fn write_end_element(
    buf: &mut Vec<u8>,
    element: &ManifestElement,
    pool: &StringPoolBuilder,
) -> BinaryXmlResult<()> {
    let (ns_idx, name_idx) = element_name_indices(element, pool)?;
    let chunk_start = begin_chunk(buf, RES_XML_END_ELEMENT_TYPE, 16);
    write_u32(buf, 0);
    write_u32(buf, NO_ENTRY_INDEX);
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    finalize_chunk(buf, chunk_start);
    Ok(())
}

fn write_cdata(buf: &mut Vec<u8>, text: &str, pool: &StringPoolBuilder) -> BinaryXmlResult<()> {
    let idx = pool
        .index_of(text)
        .ok_or_else(|| malformed("Missing CDATA text string"))?;
    let chunk_start = begin_chunk(buf, RES_XML_CDATA_TYPE, 16);
    write_u32(buf, 0);
    write_u32(buf, NO_ENTRY_INDEX);
    write_u32(buf, idx);
    write_u16(buf, 8);
    write_u8(buf, 0);
    write_u8(buf, TYPE_STRING);
    write_u32(buf, idx);
    finalize_chunk(buf, chunk_start);
    Ok(())
}

fn write_attribute(
    buf: &mut Vec<u8>,
    attr: &ManifestAttribute,
    pool: &StringPoolBuilder,
) -> BinaryXmlResult<()> {
    let ns_idx = match &attr.namespace_uri {
        Some(uri) => pool
            .index_of(uri)
            .ok_or_else(|| malformed("Missing attribute namespace URI string"))?,
        None => NO_ENTRY_INDEX,
    };
    let name_idx = pool
        .index_of(&attr.name)
        .ok_or_else(|| malformed("Missing attribute name string"))?;
    let raw_idx = match raw_value_text(&attr.value) {
        Some(text) => pool
            .index_of(text)
            .ok_or_else(|| malformed("Missing raw attribute string"))?,
        None => NO_ENTRY_INDEX,
    };
    let (data_type, data_value) = encode_typed_value(&attr.value, pool)?;
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    write_u32(buf, raw_idx);
    write_u16(buf, 8);
    write_u8(buf, 0);
    write_u8(buf, data_type);
    write_u32(buf, data_value);
    Ok(())
}

fn write_element_xml(
    element: &ManifestElement,
    writer: &mut Writer<Vec<u8>>,
    namespaces: &[NamespaceDecl],
    is_root: bool,
) -> BinaryXmlResult<()> {
    let element_name = qualified_name(element.namespace_prefix.as_deref(), &element.tag);
    let mut attr_storage = Vec::new();
    if is_root {
        for decl in namespaces {
            let attr_name = if decl.prefix.is_empty() {
                "xmlns".to_string()
            } else {
                format!("xmlns:{}", decl.prefix)
            };
            attr_storage.push((attr_name, decl.uri.clone()));
        }
    }
    for attr in &element.attributes {
        let name = qualified_name(attr.namespace_prefix.as_deref(), &attr.name);
        attr_storage.push((name, manifest_value_to_text(&attr.value)));
    }
    let mut start = BytesStart::new(element_name.as_str());
    for (key, value) in &attr_storage {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.children.is_empty() && element.text.is_none() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    if let Some(text) = &element.text {
        writer.write_event(Event::Text(BytesText::new(text)))?;
    }
    for child in &element.children {
        write_element_xml(child, writer, namespaces, false)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element_name.as_str())))?;
    Ok(())
}

fn encode_typed_value(
    value: &ManifestValue,
    pool: &StringPoolBuilder,
) -> BinaryXmlResult<(u8, u32)> {
    match value {
        ManifestValue::String(text) => {
            let idx = pool
                .index_of(text)
                .ok_or_else(|| malformed("Missing string value"))?;
            Ok((TYPE_STRING, idx))
        }
        // aapt2 encodes `true` as all bits set.
        ManifestValue::Boolean(flag) => Ok((TYPE_INT_BOOLEAN, if *flag { 0xFFFF_FFFF } else { 0 })),
        ManifestValue::Integer(num) => Ok((TYPE_INT_DEC, *num as i32 as u32)),
        ManifestValue::Hex(v) => Ok((TYPE_INT_HEX, *v)),
        ManifestValue::Reference(id) => Ok((TYPE_REFERENCE, *id)),
        ManifestValue::Raw { data_type, data } => Ok((*data_type, *data)),
    }
}

/// High-level representation of `AndroidManifest.xml`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AndroidManifest {
    root: ManifestElement,
}

impl AndroidManifest {
    pub fn from_root(root: ManifestElement) -> Self {
        AndroidManifest { root }
    }

    pub fn root(&self) -> &ManifestElement {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut ManifestElement {
        &mut self.root
    }

    pub fn package_name(&self) -> Option<&str> {
        self.root.attribute_value("package").and_then(|value| value.as_str())
    }

    pub fn application(&self) -> Option<&ManifestElement> {
        self.root.find_child("application")
    }

    pub fn from_string(xml: &str) -> BinaryXmlResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut buffer = Vec::new();
        let mut stack: Vec<ManifestElement> = Vec::new();
        let mut root: Option<ManifestElement> = None;
        let mut namespace_stack: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];

        loop {
            match reader.read_event_into(&mut buffer)? {
                Event::Start(start) => {
                    let start = start.into_owned();
                    let (decls, attrs) = extract_attributes(&start)?;
                    namespace_stack.push(decls);
                    let element = build_element_from_start(&start, &namespace_stack, attrs)?;
                    stack.push(element);
                }
                Event::Empty(start) => {
                    let start = start.into_owned();
                    let (decls, attrs) = extract_attributes(&start)?;
                    namespace_stack.push(decls);
                    let element = build_element_from_start(&start, &namespace_stack, attrs)?;
                    attach_element(&mut stack, &mut root, element)?;
                    namespace_stack.pop();
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| malformed("Unbalanced end tag in manifest"))?;
                    if namespace_stack.len() <= 1 {
                        return Err(malformed("Namespace stack underflow"));
                    }
                    namespace_stack.pop();
                    attach_element(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        let raw = text.unescape()?.into_owned();
                        if let Some(content) = parse_text_content(&raw) {
                            match &mut current.text {
                                Some(existing) => {
                                    existing.push(' ');
                                    existing.push_str(&content);
                                }
                                None => current.text = Some(content),
                            }
                        }
                    }
                }
                Event::CData(text) => {
                    if let Some(current) = stack.last_mut() {
                        let raw = std::str::from_utf8(text.as_ref())
                            .map_err(|err| malformed(err.to_string()))?;
                        if let Some(content) = parse_text_content(raw) {
                            current.text = Some(content);
                        }
                    }
                }
                Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
            buffer.clear();
        }

        if !stack.is_empty() {
            return Err(malformed("Unclosed XML elements in manifest"));
        }

        let root = root.ok_or_else(|| malformed("Manifest does not have a root element"))?;
        Ok(AndroidManifest { root })
    }

    pub fn to_string(&self) -> BinaryXmlResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        let namespaces = collect_namespace_declarations(&self.root);
        write_element_xml(&self.root, &mut writer, &namespaces, true)?;
        String::from_utf8(writer.into_inner()).map_err(|err| malformed(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> BinaryXmlResult<Self> {
        let mut reader = BinaryReader::new(bytes);
        let xml_header = read_chunk_header(&mut reader)?;
        if xml_header.chunk_type != RES_XML_TYPE {
            return Err(malformed("Binary XML does not start with RES_XML_TYPE header"));
        }

        let xml_end = xml_header.end();
        reader.seek(xml_header.start + xml_header.header_size as usize)?;

        let mut resource_map = Vec::new();
        let mut string_pool: Option<StringPool> = None;
        let mut namespaces: Vec<NamespaceFrame> = Vec::new();
        let mut element_stack: Vec<ManifestElement> = Vec::new();
        let mut root: Option<ManifestElement> = None;

        while reader.position() < xml_end {
            let chunk_header = read_chunk_header(&mut reader)?;
            let chunk_end = chunk_header.end();
            let body_start = chunk_header.start + chunk_header.header_size as usize;
            match chunk_header.chunk_type {
                RES_STRING_POOL_TYPE => {
                    string_pool = Some(StringPool::parse(&mut reader, &chunk_header)?);
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    reader.seek(body_start)?;
                    let mut ids = Vec::new();
                    while reader.position() + 4 <= chunk_end {
                        ids.push(reader.read_u32()?);
                    }
                    resource_map = ids;
                }
                RES_XML_START_NAMESPACE_TYPE => {
                    let pool = string_pool
                        .as_ref()
                        .ok_or_else(|| malformed("Namespace chunk encountered before string pool"))?;
                    reader.seek(body_start)?;
                    let prefix_idx = reader.read_u32()?;
                    let uri_idx = reader.read_u32()?;
                    let prefix = pool.get(prefix_idx).map(|s| s.to_string());
                    let uri = pool.get(uri_idx).map(|s| s.to_string());
                    namespaces.push(NamespaceFrame { prefix, uri });
                }
                RES_XML_END_NAMESPACE_TYPE => {
                    namespaces.pop();
                }
                RES_XML_START_ELEMENT_TYPE => {
                    let pool = string_pool
                        .as_ref()
                        .ok_or_else(|| malformed("Start element encountered before string pool"))?;

                    reader.seek(body_start)?;
                    let ns_idx = reader.read_u32()?;
                    let name_idx = reader.read_u32()?;
                    let attribute_start = reader.read_u16()? as usize;
                    let attribute_size = reader.read_u16()? as usize;
                    let attr_count = reader.read_u16()? as usize;
                    reader.read_u16()?; // idIndex
                    reader.read_u16()?; // classIndex
                    reader.read_u16()?; // styleIndex
                    if attribute_size < 20 {
                        return Err(malformed("Attribute records must be at least 20 bytes"));
                    }

                    let tag_name = pool
                        .get(name_idx)
                        .ok_or_else(|| malformed("Element references invalid string index"))?
                        .to_string();

                    let namespace_uri = pool.get(ns_idx).map(|s| s.to_string());
                    let namespace_prefix = resolve_prefix(&namespaces, namespace_uri.as_deref());
                    let mut element = ManifestElement::new(tag_name);
                    element.namespace_prefix = namespace_prefix;
                    element.namespace_uri = namespace_uri;

                    let mut attributes = Vec::with_capacity(attr_count);
                    for idx in 0..attr_count {
                        reader.seek(body_start + attribute_start + idx * attribute_size)?;
                        let attr_ns_idx = reader.read_u32()?;
                        let attr_name_idx = reader.read_u32()?;
                        let raw_value_idx = reader.read_u32()?;
                        let value_size = reader.read_u16()?;
                        reader.read_u8()?; // res0
                        let data_type = reader.read_u8()?;
                        let data = reader.read_u32()?;
                        if value_size != 8 {
                            return Err(malformed("Attribute value size must be 8"));
                        }
                        let attr_name = pool
                            .get(attr_name_idx)
                            .ok_or_else(|| {
                                malformed("Attribute name references invalid string index")
                            })?
                            .to_string();
                        let attr_namespace_uri = pool.get(attr_ns_idx).map(|s| s.to_string());
                        let attr_namespace =
                            resolve_prefix(&namespaces, attr_namespace_uri.as_deref());
                        let value = decode_value(pool, raw_value_idx, data_type, data)?;
                        let resource_id = resource_map
                            .get(attr_name_idx as usize)
                            .copied()
                            .filter(|id| *id != 0);
                        attributes.push(ManifestAttribute {
                            namespace_prefix: attr_namespace,
                            namespace_uri: attr_namespace_uri,
                            resource_id,
                            name: attr_name,
                            value,
                        });
                    }
                    element.attributes = attributes;
                    element_stack.push(element);
                }
                RES_XML_END_ELEMENT_TYPE => {
                    let element = element_stack
                        .pop()
                        .ok_or_else(|| malformed("End element without matching start"))?;
                    match element_stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None if root.is_none() => root = Some(element),
                        None => return Err(malformed("Multiple root elements in manifest")),
                    }
                }
                RES_XML_CDATA_TYPE => {
                    let pool = string_pool
                        .as_ref()
                        .ok_or_else(|| malformed("CDATA encountered before string pool"))?;
                    reader.seek(body_start)?;
                    let data_idx = reader.read_u32()?;
                    if let Some(text) = pool.get(data_idx) {
                        if let Some(current) = element_stack.last_mut() {
                            current.text = Some(text.to_string());
                        }
                    }
                }
                _ => {
                    // Unknown chunk type; skip over it for forward compatibility.
                }
            }
            reader.seek(chunk_end)?;
        }

        if !element_stack.is_empty() {
            return Err(malformed("Unclosed XML elements at end of document"));
        }

        let root = root.ok_or_else(|| malformed("AndroidManifest is empty"))?;
        Ok(AndroidManifest { root })
    }

    pub fn to_bytes(&self) -> BinaryXmlResult<Vec<u8>> {
        let mut pool_builder = StringPoolBuilder::new();

        // Resource-mapped attribute names must occupy the first pool slots.
        let mut resource_attrs = BTreeSet::new();
        collect_resource_attributes(&self.root, &mut resource_attrs);
        let mut resource_ids = Vec::with_capacity(resource_attrs.len());
        for (id, name) in &resource_attrs {
            let idx = pool_builder.intern(name);
            if idx as usize == resource_ids.len() {
                resource_ids.push(*id);
            }
        }

        let namespaces = collect_namespace_declarations(&self.root);
        for decl in &namespaces {
            pool_builder.intern(&decl.prefix);
            pool_builder.intern(&decl.uri);
        }
        collect_element_strings(&self.root, &mut pool_builder);
        let string_chunk = pool_builder.to_chunk();

        let mut body = Vec::new();
        if !resource_ids.is_empty() {
            write_resource_map(&mut body, &resource_ids);
        }
        for decl in &namespaces {
            write_namespace_chunk(&mut body, &pool_builder, decl, true)?;
        }
        write_element_recursive(&self.root, &mut body, &pool_builder)?;
        for decl in namespaces.iter().rev() {
            write_namespace_chunk(&mut body, &pool_builder, decl, false)?;
        }

        let mut document = Vec::new();
        let xml_start = begin_chunk(&mut document, RES_XML_TYPE, 8);
        document.extend_from_slice(&string_chunk);
        document.extend_from_slice(&body);
        finalize_chunk(&mut document, xml_start);
        Ok(document)
    }
}
