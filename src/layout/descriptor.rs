//! Descriptor string parsing and field packing.

use std::collections::HashSet;

/// Field packing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Packing {
    /// Uniform-block packing: no field straddles a 16-byte boundary and the
    /// total size is a multiple of 16.
    #[default]
    Std140,
    /// Vertex packing: fields are laid out back to back.
    Tight,
}

/// One `<type> <name>[<count>]` declaration from a descriptor string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    pub type_name: String,
    pub name: String,
    pub array_size: usize,
}

/// Tokenize a descriptor string into field declarations.
///
/// Whitespace and punctuation separate tokens. Types are alphanumeric, names
/// may also contain `_`, and a name may be followed by `[N]`.
pub fn parse_fields(descriptor: &str) -> Vec<FieldDecl> {
    let bytes = descriptor.as_bytes();
    let mut fields = Vec::new();
    let mut p = 0;

    let skip_separators = |p: &mut usize| {
        while *p < bytes.len() && (bytes[*p].is_ascii_whitespace() || bytes[*p].is_ascii_punctuation())
        {
            *p += 1;
        }
    };

    loop {
        skip_separators(&mut p);
        let type_start = p;
        while p < bytes.len() && bytes[p].is_ascii_alphanumeric() {
            p += 1;
        }
        if p == type_start {
            break;
        }
        let type_name = &descriptor[type_start..p];

        while p < bytes.len() && bytes[p].is_ascii_whitespace() {
            p += 1;
        }
        let name_start = p;
        while p < bytes.len() && (bytes[p].is_ascii_alphanumeric() || bytes[p] == b'_') {
            p += 1;
        }
        if p == name_start {
            log::error!(
                "DataDescriptor: SYNTAX ERROR: expecting name after type {} in '{}'",
                type_name,
                descriptor
            );
            break;
        }
        let name = &descriptor[name_start..p];

        let mut array_size = 1;
        if p < bytes.len() && bytes[p] == b'[' {
            p += 1;
            let digits_start = p;
            while p < bytes.len() && bytes[p].is_ascii_digit() {
                p += 1;
            }
            array_size = descriptor[digits_start..p].parse::<usize>().unwrap_or(1).max(1);
            if p < bytes.len() && bytes[p] == b']' {
                p += 1;
            }
        }

        fields.push(FieldDecl {
            type_name: type_name.to_string(),
            name: name.to_string(),
            array_size,
        });
    }
    fields
}

/// Byte size of one element of a descriptor type, 0 when unknown.
pub fn calc_size(type_name: &str) -> usize {
    match type_name {
        "float" | "int" => 4,
        "float2" | "int2" => 8,
        "float3" | "int3" => 12,
        "float4" | "int4" => 16,
        "mat3" => 48,
        "mat4" => 64,
        _ => 0,
    }
}

/// GLSL type for a descriptor type.
fn make_shader_type(type_name: &str, element_size: usize, array_size: usize) -> String {
    let is_vector = element_size > 4 && element_size <= 16;
    let base = if is_vector && (type_name.starts_with('f') || type_name.starts_with('i')) {
        format!("vec{}", element_size / 4)
    } else {
        type_name.to_string()
    };
    if array_size > 1 {
        format!("{}[{}]", base, array_size)
    } else {
        base
    }
}

/// Layout of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntry {
    /// Declaration order among accepted fields
    pub index: usize,
    pub offset: usize,
    /// Total byte size including array elements
    pub size: usize,
    pub array_size: usize,
    pub name: String,
    /// Descriptor type (`float3`, `mat4`, ...)
    pub type_name: String,
    /// GLSL type (`vec3`, `mat4[60]`, ...)
    pub shader_type: String,
    pub is_set: bool,
}

impl DataEntry {
    pub fn is_int(&self) -> bool {
        self.type_name.starts_with("int")
    }

    pub fn is_matrix(&self) -> bool {
        self.type_name.starts_with("mat")
    }

    /// Byte size of one array element.
    pub fn element_size(&self) -> usize {
        self.size / self.array_size.max(1)
    }
}

/// Field table built once from a descriptor string.
#[derive(Debug, Clone)]
pub struct DataDescriptor {
    descriptor: String,
    packing: Packing,
    entries: Vec<DataEntry>,
    total_size: usize,
}

impl DataDescriptor {
    pub fn new(descriptor: &str) -> Self {
        Self::with_packing(descriptor, Packing::Std140)
    }

    pub fn with_packing(descriptor: &str, packing: Packing) -> Self {
        if descriptor.trim().is_empty() {
            log::debug!("DataDescriptor: empty descriptor string");
        }

        let mut entries: Vec<DataEntry> = Vec::new();
        let mut seen = HashSet::new();
        let mut total_size = 0usize;

        for field in parse_fields(descriptor) {
            let element_size = calc_size(&field.type_name);
            if element_size == 0 {
                log::error!(
                    "DataDescriptor: SYNTAX ERROR: unknown type {} for {}, field skipped",
                    field.type_name,
                    field.name
                );
                continue;
            }
            if !seen.insert(field.name.clone()) {
                log::error!(
                    "DataDescriptor: duplicate field {} in '{}', skipped",
                    field.name,
                    descriptor
                );
                continue;
            }

            let size = element_size * field.array_size;
            let mut offset = total_size;
            if packing == Packing::Std140 && offset + size - (offset & !15) > 16 {
                offset = (offset + 15) & !15;
            }

            log::trace!(
                "DataDescriptor: {} offset={} size={}",
                field.name,
                offset,
                size
            );
            entries.push(DataEntry {
                index: entries.len(),
                offset,
                size,
                array_size: field.array_size,
                shader_type: make_shader_type(&field.type_name, element_size, field.array_size),
                name: field.name,
                type_name: field.type_name,
                is_set: false,
            });
            total_size = offset + size;
        }

        if packing == Packing::Std140 {
            total_size = (total_size + 15) & !15;
        }

        Self {
            descriptor: descriptor.to_string(),
            packing,
            entries,
            total_size,
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn packing(&self) -> Packing {
        self.packing
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn entries(&self) -> &[DataEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&DataEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Byte size of a field, 0 if it is not declared.
    pub fn byte_size(&self, name: &str) -> usize {
        self.find(name).map_or(0, |e| e.size)
    }

    pub fn mark_set(&mut self, name: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.is_set = true;
        }
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.find(name).is_some_and(|e| e.is_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        let fields = parse_fields("float3 u_color; float u_opacity, mat4 u_bones[12]");
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].type_name, "float3");
        assert_eq!(fields[0].name, "u_color");
        assert_eq!(fields[2].name, "u_bones");
        assert_eq!(fields[2].array_size, 12);
    }

    #[test]
    fn test_std140_packing() {
        let desc = DataDescriptor::new("float u_a float3 u_b float4 u_c mat4 u_d");
        let offsets: Vec<_> = desc.entries().iter().map(|e| e.offset).collect();
        // float3 at 4 ends at 16 and stays; float4 at 16; mat4 at 32
        assert_eq!(offsets, vec![0, 4, 16, 32]);
        assert_eq!(desc.total_size(), 96);
    }

    #[test]
    fn test_std140_realigns_straddling_field() {
        let desc = DataDescriptor::new("float u_a float4 u_b float2 u_c");
        assert_eq!(desc.find("u_b").unwrap().offset, 16);
        assert_eq!(desc.find("u_c").unwrap().offset, 32);
        assert_eq!(desc.total_size(), 48);
    }

    #[test]
    fn test_tight_packing() {
        let desc = DataDescriptor::with_packing("float3 a_position float2 a_texcoord", Packing::Tight);
        assert_eq!(desc.find("a_texcoord").unwrap().offset, 12);
        assert_eq!(desc.total_size(), 20);
    }

    #[test]
    fn test_unknown_type_skipped() {
        let desc = DataDescriptor::new("float u_a bogus u_b float4 u_c");
        assert_eq!(desc.len(), 2);
        assert!(desc.find("u_b").is_none());
        assert_eq!(desc.find("u_c").unwrap().index, 1);
    }

    #[test]
    fn test_duplicate_field_skipped() {
        let desc = DataDescriptor::new("float u_a float4 u_a");
        assert_eq!(desc.len(), 1);
        assert_eq!(desc.byte_size("u_a"), 4);
    }

    #[test]
    fn test_shader_types() {
        let desc = DataDescriptor::new("int3 u_i float2 u_f mat4 u_m[2] float u_s");
        let types: Vec<_> = desc.entries().iter().map(|e| e.shader_type.as_str()).collect();
        assert_eq!(types, vec!["vec3", "vec2", "mat4[2]", "float"]);
    }

    #[test]
    fn test_layout_properties_hold() {
        let schemas = [
            "float a float3 b float2 c float4 d",
            "int e float2 f float3 g mat3 h float i",
            "float3 j float3 k float3 l int4 m",
            "mat4 n[2] float o float2 p float2 q float3 r",
        ];
        for schema in schemas {
            let desc = DataDescriptor::new(schema);
            assert_eq!(desc.total_size() % 16, 0, "{}", schema);
            for e in desc.entries() {
                if e.size <= 16 {
                    assert_eq!(e.offset / 16, (e.offset + e.size - 1) / 16, "{} in {}", e.name, schema);
                } else {
                    assert_eq!(e.offset % 16, 0, "{} in {}", e.name, schema);
                }
            }
        }
    }
}
