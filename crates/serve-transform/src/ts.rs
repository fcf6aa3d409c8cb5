//! TypeScript producer: oxc parse -> semantic -> transform -> codegen.
//!
//! The whole pass is synchronous CPU work; callers run it on a blocking
//! worker and race it against shutdown. Output is a plain ES module for the
//! configured target with the source map inlined as a data URL, which keeps
//! the serving path to a single response body.

use crate::cache::TransformEntry;
use crate::error::TransformError;
use base64::Engine as _;
use oxc_allocator::Allocator;
use oxc_codegen::{Codegen, CodegenOptions};
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;
use oxc_transformer::{TransformOptions, Transformer};
use serve_events::{ErrorKind, SourceLoc};
use std::path::Path;

pub const JS_CONTENT_TYPE: &str = "application/javascript";

/// Transpile `source` (TS/TSX/JS) to the given ECMAScript target.
pub fn transpile(path: &Path, source: &str, target: &str) -> Result<TransformEntry, TransformError> {
    let options = parse_target(target)?;
    let allocator = Allocator::default();
    let source_type = SourceType::from_path(path).unwrap_or_else(|_| SourceType::ts());

    let parsed = Parser::new(&allocator, source, source_type).parse();
    if parsed.panicked || !parsed.errors.is_empty() {
        return Err(diagnostic_error(path, source, parsed.errors));
    }

    let mut program = parsed.program;
    let scoping = SemanticBuilder::new()
        .build(&program)
        .semantic
        .into_scoping();
    let transformed = Transformer::new(&allocator, path, &options)
        .build_with_scoping(scoping, &mut program);
    if !transformed.errors.is_empty() {
        return Err(diagnostic_error(path, source, transformed.errors));
    }

    let out = Codegen::new()
        .with_options(CodegenOptions {
            source_map_path: Some(path.to_path_buf()),
            ..CodegenOptions::default()
        })
        .build(&program);

    let map_json = out.map.map(|m| m.to_json_string());
    let mut code = out.code;
    if let Some(map) = &map_json {
        let encoded = base64::engine::general_purpose::STANDARD.encode(map);
        code.push_str("\n//# sourceMappingURL=data:application/json;base64,");
        code.push_str(&encoded);
        code.push('\n');
    }

    Ok(TransformEntry::new(
        code.into_bytes(),
        map_json,
        JS_CONTENT_TYPE,
    ))
}

fn parse_target(target: &str) -> Result<TransformOptions, TransformError> {
    let lower = target.to_ascii_lowercase();
    let normalized = if lower == "es6" { "es2015" } else { lower.as_str() };
    TransformOptions::from_target(normalized)
        .map_err(|_| TransformError::UnsupportedTarget(target.to_string()))
}

fn diagnostic_error(
    path: &Path,
    source: &str,
    errors: Vec<oxc_diagnostics::OxcDiagnostic>,
) -> TransformError {
    let first = errors.into_iter().next();
    let (message, loc) = match first {
        Some(diagnostic) => {
            let loc = diagnostic
                .labels
                .as_ref()
                .and_then(|labels| labels.first())
                .map(|label| offset_to_loc(source, label.offset()));
            (diagnostic.message.to_string(), loc)
        }
        None => ("unknown transform failure".to_string(), None),
    };
    TransformError::Parse {
        kind: ErrorKind::Ts,
        path: path.to_path_buf(),
        message,
        loc,
    }
}

/// 1-based line/column for a byte offset.
fn offset_to_loc(source: &str, offset: usize) -> SourceLoc {
    let clamped = offset.min(source.len());
    let before = &source[..clamped];
    let line = before.bytes().filter(|b| *b == b'\n').count() as u32 + 1;
    let col = before
        .rfind('\n')
        .map(|nl| clamped - nl - 1)
        .unwrap_or(clamped) as u32
        + 1;
    SourceLoc { line, col }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn transpiles_types_away() {
        let source = "export const greet = (name: string): string => `hi ${name}`;\n";
        let entry = transpile(&PathBuf::from("src/greet.ts"), source, "es2022").unwrap();
        let code = String::from_utf8(entry.bytes).unwrap();
        assert!(code.contains("export const greet"));
        assert!(!code.contains(": string"), "type annotations stripped");
        assert_eq!(entry.content_type, JS_CONTENT_TYPE);
    }

    #[test]
    fn emits_inline_source_map() {
        let source = "export class MyCard extends HTMLElement {}\n";
        let entry = transpile(&PathBuf::from("src/my-card.ts"), source, "es2022").unwrap();
        assert!(entry.source_map.is_some());
        let code = String::from_utf8(entry.bytes).unwrap();
        assert!(code.contains("sourceMappingURL=data:application/json;base64,"));
    }

    #[test]
    fn syntax_error_reports_location() {
        let source = "export const broken = {\n";
        let err = transpile(&PathBuf::from("src/broken.ts"), source, "es2022").unwrap_err();
        match err {
            TransformError::Parse { kind, path, loc, .. } => {
                assert_eq!(kind, ErrorKind::Ts);
                assert_eq!(path, PathBuf::from("src/broken.ts"));
                assert!(loc.is_some());
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_target() {
        let err = transpile(&PathBuf::from("a.ts"), "export {}\n", "es1999").unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedTarget(_)));
    }

    #[test]
    fn offset_to_loc_is_one_based() {
        let source = "abc\ndef\n";
        assert_eq!(offset_to_loc(source, 0), SourceLoc { line: 1, col: 1 });
        assert_eq!(offset_to_loc(source, 5), SourceLoc { line: 2, col: 2 });
    }
}
