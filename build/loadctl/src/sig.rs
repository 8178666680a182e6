// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C function signature extraction.
//!
//! Finds the definition of the target function in the entry source,
//! captures its return type and parameter list (multi-line lists included,
//! by matching parentheses rather than trusting a single regex line), and
//! classifies every parameter as value or pointer. Classification is
//! purely syntactic: a `*` or `[]` in the declarator makes it a pointer.
//!
//! The type vocabulary is the fixed-width preamble that also gets emitted
//! into the generated declaration header — a user-defined type that isn't
//! in it fails here, by name, rather than mysteriously at compile time.

use std::fmt;

use regex::Regex;

use wire::MAX_ARGS;

/// Scalar machine types the argument frame can carry. Everything is at
/// most one 32-bit slot wide.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
}

impl Scalar {
    pub fn size(self) -> usize {
        match self {
            Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
        }
    }

    pub fn signed(self) -> bool {
        matches!(self, Scalar::I8 | Scalar::I16 | Scalar::I32)
    }

    /// The fixed-width spelling used in generated code.
    pub fn c_name(self) -> &'static str {
        match self {
            Scalar::I8 => "int8_t",
            Scalar::U8 => "uint8_t",
            Scalar::I16 => "int16_t",
            Scalar::U16 => "uint16_t",
            Scalar::I32 => "int32_t",
            Scalar::U32 => "uint32_t",
            Scalar::F32 => "float",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParamClass {
    Value,
    Pointer,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: String,
    /// Canonical C type text for generated code, e.g. `float *`.
    pub text: String,
    pub class: ParamClass,
    /// The value type, or the pointee element type for pointers.
    pub scalar: Option<Scalar>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetKind {
    Void,
    Pointer,
    Scalar(Scalar),
    /// Returned by value but stored to the frame as `float`; documented
    /// lossy.
    Double,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Signature {
    pub name: String,
    /// Canonical return type text, e.g. `int32_t` or `float *`.
    pub ret_text: String,
    pub ret: RetKind,
    pub params: Vec<Param>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SigError {
    /// No definition of the function was found in the entry source.
    NotFound(String),
    /// A type in the signature isn't in the fixed-width preamble.
    UnknownType(String),
    /// 64-bit and aggregate returns don't fit the single return slot.
    UnsupportedReturn(String),
    UnsupportedParam { index: usize, ty: String },
    TooManyParams(usize),
}

impl fmt::Display for SigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigError::NotFound(name) => {
                write!(f, "no definition of `{name}` found in entry source")
            }
            SigError::UnknownType(ty) => write!(
                f,
                "type `{ty}` is not declared in the typedef preamble"
            ),
            SigError::UnsupportedReturn(ty) => write!(
                f,
                "return type `{ty}` does not fit the 32-bit return slot"
            ),
            SigError::UnsupportedParam { index, ty } => write!(
                f,
                "parameter {index}: type `{ty}` cannot be marshalled"
            ),
            SigError::TooManyParams(n) => write!(
                f,
                "{n} parameters exceed the {MAX_ARGS} argument slots"
            ),
        }
    }
}

impl std::error::Error for SigError {}

/// Locates the definition of `name` in `source` and parses its signature.
pub fn parse_signature(source: &str, name: &str) -> Result<Signature, SigError> {
    let clean = strip_comments_and_strings(source);
    let (ret_text, params_text) =
        locate_definition(&clean, name).ok_or_else(|| SigError::NotFound(name.to_string()))?;

    let ret = parse_return_type(&ret_text)?;
    let params = parse_params(&params_text)?;
    if params.len() > MAX_ARGS {
        return Err(SigError::TooManyParams(params.len()));
    }

    Ok(Signature {
        name: name.to_string(),
        ret_text: canonical_type_text(&ret, &ret_text),
        ret,
        params,
    })
}

/// Blanks comments, string/char literals, and preprocessor lines so they
/// can't fake (or hide) a definition, and so the backward scan for a
/// return type never lands inside an `#include`.
fn strip_comments_and_strings(source: &str) -> String {
    // Order matters: block comments may contain `//`, strings may contain
    // either.
    let block = Regex::new(r"(?s)/\*.*?\*/").unwrap();
    let line = Regex::new(r"//[^\n]*").unwrap();
    let string = Regex::new(r#""(?:[^"\\\n]|\\.)*""#).unwrap();
    let ch = Regex::new(r"'(?:[^'\\\n]|\\.)*'").unwrap();
    let preprocessor = Regex::new(r"(?m)^[ \t]*#[^\n]*").unwrap();

    let s = block.replace_all(source, " ");
    let s = line.replace_all(&s, " ");
    let s = string.replace_all(&s, "\"\"");
    let s = ch.replace_all(&s, "' '");
    preprocessor.replace_all(&s, ";").into_owned()
}

/// Finds `name`'s definition: returns the raw return-type text and the raw
/// parameter-list text. Multi-line parameter lists are handled by scanning
/// to the balancing close paren; the next non-whitespace character must
/// open the function body.
fn locate_definition(clean: &str, name: &str) -> Option<(String, String)> {
    let pattern = Regex::new(&format!(r"\b{}\s*\(", regex::escape(name))).unwrap();

    for m in pattern.find_iter(clean) {
        let open = clean[m.start()..].find('(').unwrap() + m.start();

        // Balance parentheses to find the end of the parameter list.
        let mut depth = 0usize;
        let mut close = None;
        for (i, c) in clean[open..].char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(open + i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let close = close?;

        // Definition, not declaration or call: a body must follow.
        let after = clean[close + 1..].trim_start();
        if !after.starts_with('{') {
            continue;
        }

        // The return type is whatever sits between the previous statement
        // boundary and the function name.
        let before = &clean[..m.start()];
        let boundary = before
            .rfind([';', '}', '{', ')', '#'])
            .map(|i| i + 1)
            .unwrap_or(0);
        let mut ret = before[boundary..].trim().to_string();
        for specifier in ["static", "inline", "extern"] {
            ret = ret
                .split_whitespace()
                .filter(|w| *w != specifier)
                .collect::<Vec<_>>()
                .join(" ");
        }
        if ret.is_empty()
            || !ret
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '*' || c.is_whitespace())
        {
            // Probably a call site (`x = name(...)`); keep looking.
            continue;
        }

        let params = clean[open + 1..close].to_string();
        return Some((ret, params));
    }
    None
}

/// Resolves a base type (qualifiers removed, `unsigned`/`signed` tracked
/// separately) to a scalar, `None` for `void`.
fn resolve_base(words: &[&str], unsigned: bool) -> Result<Option<Scalar>, SigError> {
    let joined = words.join(" ");
    let scalar = match joined.as_str() {
        "void" => return Ok(None),
        "char" => {
            if unsigned {
                Scalar::U8
            } else {
                Scalar::I8
            }
        }
        "short" | "short int" => {
            if unsigned {
                Scalar::U16
            } else {
                Scalar::I16
            }
        }
        // `unsigned` / `signed` with no base word means int.
        "" | "int" | "long" | "long int" => {
            if unsigned {
                Scalar::U32
            } else {
                Scalar::I32
            }
        }
        "float" => Scalar::F32,
        "int8_t" => Scalar::I8,
        "uint8_t" | "bool" | "_Bool" => Scalar::U8,
        "int16_t" => Scalar::I16,
        "uint16_t" => Scalar::U16,
        "int32_t" => Scalar::I32,
        "uint32_t" | "size_t" | "uintptr_t" => Scalar::U32,
        "intptr_t" | "ptrdiff_t" => Scalar::I32,
        "long long" | "long long int" | "int64_t" | "uint64_t" | "double" => {
            // Recognized, but not representable in one slot; callers decide
            // whether that's fatal (params) or special-cased (double
            // return). Signal via a sentinel error carrying the spelling.
            return Err(SigError::UnknownType(wide_spelling(&joined, unsigned)))
        }
        other => return Err(SigError::UnknownType(other.to_string())),
    };
    Ok(Some(scalar))
}

fn wide_spelling(joined: &str, unsigned: bool) -> String {
    if unsigned {
        format!("unsigned {joined}")
    } else {
        joined.to_string()
    }
}

fn is_wide(joined: &str) -> bool {
    matches!(
        joined.trim_start_matches("unsigned ").trim_start_matches("signed "),
        "long long" | "long long int" | "int64_t" | "uint64_t" | "double"
    )
}

struct Declarator {
    name: Option<String>,
    base_words: Vec<String>,
    unsigned: bool,
    pointer: bool,
    aggregate: bool,
}

/// Tokenizes one declaration (a parameter, or a return type with no name)
/// into base-type words, pointer-ness, and the declarator name.
fn split_declarator(text: &str) -> Declarator {
    let mut pointer = false;
    let mut unsigned = false;
    let mut aggregate = false;
    let mut words: Vec<String> = Vec::new();

    // `*` and `[` are self-delimiting; split them off the identifiers.
    let spaced = text.replace('*', " * ").replace('[', " [ ").replace(']', " ] ");
    for token in spaced.split_whitespace() {
        match token {
            "*" | "[" | "]" => pointer = true,
            "unsigned" => unsigned = true,
            "signed" | "const" | "volatile" | "restrict" | "register" => {}
            "struct" | "union" | "enum" => aggregate = true,
            w => words.push(w.to_string()),
        }
    }

    // The declarator name, if present, is a trailing identifier that isn't
    // part of a known type spelling — `float data` names `data`, `unsigned
    // n` names `n`, while `long int` names nothing.
    let mut name = None;
    if !words.is_empty() {
        let last = words.last().unwrap().as_str();
        let head: Vec<&str> =
            words[..words.len() - 1].iter().map(|s| s.as_str()).collect();
        let head_is_type = if head.is_empty() {
            // A lone trailing word is a name only when a type was implied
            // some other way (`unsigned n`, `struct dev *p`).
            unsigned || aggregate
        } else {
            resolve_base(&head, unsigned).is_ok()
                || is_wide(&head.join(" "))
                || aggregate
        };
        let last_is_type_word = matches!(
            last,
            "int" | "char" | "short" | "long" | "float" | "double" | "void"
        );
        if head_is_type && !last_is_type_word {
            name = Some(words.pop().unwrap());
        }
    }

    Declarator {
        name,
        base_words: words,
        unsigned,
        pointer,
        aggregate,
    }
}

fn parse_return_type(text: &str) -> Result<RetKind, SigError> {
    let d = split_declarator(text);
    if d.aggregate && !d.pointer {
        // Aggregates by value don't fit the return slot; pointers to them
        // are ordinary 32-bit addresses.
        return Err(SigError::UnsupportedReturn(text.trim().to_string()));
    }
    let words: Vec<&str> = d.base_words.iter().map(|s| s.as_str()).collect();
    if d.pointer {
        if d.aggregate {
            return Ok(RetKind::Pointer);
        }
        // Pointee type doesn't matter for the return path; it's stored as
        // a 32-bit address either way. It still must be a known type.
        match resolve_base(&words, d.unsigned) {
            Ok(_) => {}
            Err(SigError::UnknownType(ty)) if !is_wide(&ty) => {
                return Err(SigError::UnknownType(ty))
            }
            Err(_) => {}
        }
        return Ok(RetKind::Pointer);
    }
    let joined = words.join(" ");
    if joined == "double" {
        return Ok(RetKind::Double);
    }
    match resolve_base(&words, d.unsigned) {
        Ok(None) => Ok(RetKind::Void),
        Ok(Some(s)) => Ok(RetKind::Scalar(s)),
        Err(SigError::UnknownType(ty)) if is_wide(&ty) => {
            Err(SigError::UnsupportedReturn(ty))
        }
        Err(e) => Err(e),
    }
}

fn parse_params(text: &str) -> Result<Vec<Param>, SigError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "void" {
        return Ok(Vec::new());
    }

    let mut params = Vec::new();
    for (index, piece) in split_top_level_commas(trimmed).iter().enumerate() {
        let piece = piece.trim();
        if piece == "..." {
            return Err(SigError::UnsupportedParam {
                index,
                ty: "...".to_string(),
            });
        }

        let d = split_declarator(piece);
        if d.aggregate && !d.pointer {
            return Err(SigError::UnsupportedParam {
                index,
                ty: piece.to_string(),
            });
        }

        let words: Vec<&str> = d.base_words.iter().map(|s| s.as_str()).collect();
        let scalar = match resolve_base(&words, d.unsigned) {
            Ok(s) => s,
            Err(SigError::UnknownType(ty)) if is_wide(&ty) => {
                if d.pointer {
                    // Pointers to wide types pass as addresses, but their
                    // contents can't be marshalled as arrays.
                    None
                } else {
                    return Err(SigError::UnsupportedParam { index, ty });
                }
            }
            // `struct foo *` is a legal opaque pointer.
            Err(SigError::UnknownType(_)) if d.aggregate => None,
            Err(e) => return Err(e),
        };

        if !d.pointer && scalar.is_none() {
            // Bare `void` in a multi-parameter list.
            return Err(SigError::UnsupportedParam {
                index,
                ty: piece.to_string(),
            });
        }

        let class = if d.pointer {
            ParamClass::Pointer
        } else {
            ParamClass::Value
        };
        let text = if d.pointer {
            match scalar {
                Some(s) => format!("{} *", s.c_name()),
                None => "void *".to_string(),
            }
        } else {
            scalar.unwrap().c_name().to_string()
        };

        params.push(Param {
            name: d.name.unwrap_or_else(|| format!("a{index}")),
            text,
            class,
            scalar,
        });
    }
    Ok(params)
}

fn split_top_level_commas(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                pieces.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&text[start..]);
    pieces
}

/// Canonical text for the return type as generated code spells it.
fn canonical_type_text(ret: &RetKind, raw: &str) -> String {
    match ret {
        RetKind::Void => "void".to_string(),
        RetKind::Double => "double".to_string(),
        RetKind::Scalar(s) => s.c_name().to_string(),
        RetKind::Pointer => {
            let d = split_declarator(raw);
            let words: Vec<&str> = d.base_words.iter().map(|s| s.as_str()).collect();
            match resolve_base(&words, d.unsigned) {
                Ok(Some(s)) => format!("{} *", s.c_name()),
                _ => "void *".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_add() {
        let src = "int add(int a, int b) { return a + b; }";
        let sig = parse_signature(src, "add").unwrap();
        assert_eq!(sig.name, "add");
        assert_eq!(sig.ret, RetKind::Scalar(Scalar::I32));
        assert_eq!(sig.ret_text, "int32_t");
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sig.params[0].name, "a");
        assert_eq!(sig.params[0].class, ParamClass::Value);
        assert_eq!(sig.params[0].scalar, Some(Scalar::I32));
    }

    #[test]
    fn pointer_params_and_void_return() {
        let src = "void scale(float* data, int n, float factor) { }";
        let sig = parse_signature(src, "scale").unwrap();
        assert_eq!(sig.ret, RetKind::Void);
        assert_eq!(sig.params[0].class, ParamClass::Pointer);
        assert_eq!(sig.params[0].scalar, Some(Scalar::F32));
        assert_eq!(sig.params[0].text, "float *");
        assert_eq!(sig.params[1].class, ParamClass::Value);
        assert_eq!(sig.params[2].scalar, Some(Scalar::F32));
    }

    #[test]
    fn multi_line_parameter_list() {
        let src = "\nuint32_t mix(\n    const uint8_t *key,\n    uint16_t rounds,\n    int8_t bias\n)\n{\n    return 0;\n}\n";
        let sig = parse_signature(src, "mix").unwrap();
        assert_eq!(sig.ret, RetKind::Scalar(Scalar::U32));
        assert_eq!(sig.params.len(), 3);
        assert_eq!(sig.params[0].name, "key");
        assert_eq!(sig.params[0].class, ParamClass::Pointer);
        assert_eq!(sig.params[0].scalar, Some(Scalar::U8));
        assert_eq!(sig.params[1].scalar, Some(Scalar::U16));
        assert_eq!(sig.params[2].scalar, Some(Scalar::I8));
    }

    #[test]
    fn array_suffix_is_a_pointer() {
        let src = "int sum(int values[], unsigned n) { return 0; }";
        let sig = parse_signature(src, "sum").unwrap();
        assert_eq!(sig.params[0].class, ParamClass::Pointer);
        assert_eq!(sig.params[0].name, "values");
        assert_eq!(sig.params[1].scalar, Some(Scalar::U32));
    }

    #[test]
    fn declaration_alone_is_not_a_definition() {
        let src = "int add(int a, int b);\n";
        assert_eq!(
            parse_signature(src, "add"),
            Err(SigError::NotFound("add".to_string()))
        );
    }

    #[test]
    fn declaration_before_definition_is_skipped() {
        let src = "int add(int a, int b);\nint add(int a, int b) { return a + b; }";
        let sig = parse_signature(src, "add").unwrap();
        assert_eq!(sig.params.len(), 2);
    }

    #[test]
    fn call_sites_are_not_definitions() {
        let src = "int wrapper(void) { return add(1, 2); }\nint add(int a, int b) { return a + b; }";
        let sig = parse_signature(src, "add").unwrap();
        assert_eq!(sig.ret, RetKind::Scalar(Scalar::I32));
    }

    #[test]
    fn preprocessor_lines_do_not_pollute_the_return_type() {
        let src = "#include <stdint.h>\n#define N 4\nint add(int a, int b) { return a + b; }";
        let sig = parse_signature(src, "add").unwrap();
        assert_eq!(sig.ret, RetKind::Scalar(Scalar::I32));
        assert_eq!(sig.params.len(), 2);
    }

    #[test]
    fn commented_out_definitions_are_ignored() {
        let src = "// int add(int bogus) { }\n/* int add(char x) { } */\nint add(int a, int b) { return a + b; }";
        let sig = parse_signature(src, "add").unwrap();
        assert_eq!(sig.params.len(), 2);
    }

    #[test]
    fn void_parameter_list_is_empty() {
        let src = "uint32_t ticks(void) { return 1; }";
        let sig = parse_signature(src, "ticks").unwrap();
        assert!(sig.params.is_empty());
    }

    #[test]
    fn unnamed_params_get_synthesized_names() {
        let src = "int poke(int, float) { return 0; }";
        let sig = parse_signature(src, "poke").unwrap();
        assert_eq!(sig.params[0].name, "a0");
        assert_eq!(sig.params[1].name, "a1");
    }

    #[test]
    fn sixty_four_bit_return_rejected() {
        let src = "long long big(void) { return 0; }";
        assert!(matches!(
            parse_signature(src, "big"),
            Err(SigError::UnsupportedReturn(_))
        ));

        let src = "uint64_t big(void) { return 0; }";
        assert!(matches!(
            parse_signature(src, "big"),
            Err(SigError::UnsupportedReturn(_))
        ));
    }

    #[test]
    fn struct_return_rejected() {
        let src = "struct point origin(void) { struct point p; return p; }";
        assert!(matches!(
            parse_signature(src, "origin"),
            Err(SigError::UnsupportedReturn(_))
        ));
    }

    #[test]
    fn struct_pointer_param_is_an_opaque_pointer() {
        let src = "int probe(struct device *dev) { return 0; }";
        let sig = parse_signature(src, "probe").unwrap();
        assert_eq!(sig.params[0].class, ParamClass::Pointer);
        assert_eq!(sig.params[0].scalar, None);
        assert_eq!(sig.params[0].text, "void *");
    }

    #[test]
    fn sixty_four_bit_value_param_rejected() {
        let src = "int f(uint64_t x) { return 0; }";
        assert_eq!(
            parse_signature(src, "f"),
            Err(SigError::UnsupportedParam {
                index: 0,
                ty: "uint64_t".to_string()
            })
        );
    }

    #[test]
    fn unknown_type_is_named_in_the_error() {
        let src = "int f(matrix_t m) { return 0; }";
        assert_eq!(
            parse_signature(src, "f"),
            Err(SigError::UnknownType("matrix_t".to_string()))
        );
    }

    #[test]
    fn double_return_is_the_lossy_special_case() {
        let src = "double mean(float *x, int n) { return 0; }";
        let sig = parse_signature(src, "mean").unwrap();
        assert_eq!(sig.ret, RetKind::Double);
    }

    #[test]
    fn pointer_return() {
        let src = "float *head(float *x) { return x; }";
        let sig = parse_signature(src, "head").unwrap();
        assert_eq!(sig.ret, RetKind::Pointer);
        assert_eq!(sig.ret_text, "float *");
    }

    #[test]
    fn too_many_params_rejected() {
        let params: Vec<String> =
            (0..32).map(|i| format!("int p{i}")).collect();
        let src = format!("int f({}) {{ return 0; }}", params.join(", "));
        assert_eq!(
            parse_signature(&src, "f"),
            Err(SigError::TooManyParams(32))
        );
    }

    #[test]
    fn static_and_inline_specifiers_are_stripped() {
        let src = "static inline unsigned short crc(const uint8_t *p, int n) { return 0; }";
        let sig = parse_signature(src, "crc").unwrap();
        assert_eq!(sig.ret, RetKind::Scalar(Scalar::U16));
    }

    #[test]
    fn preceding_code_does_not_confuse_the_return_type() {
        let src = "int other(void) { return 3; }\n\nfloat blend(float a, float b) { return a + b; }";
        let sig = parse_signature(src, "blend").unwrap();
        assert_eq!(sig.ret, RetKind::Scalar(Scalar::F32));
        assert_eq!(sig.ret_text, "float");
    }
}
