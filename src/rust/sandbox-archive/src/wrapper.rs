//! Last-line-interactive wrapping.
//!
//! The rewrite itself runs *inside* the sandbox: our job here is pure string templating, not
//! Python parsing. We embed the caller's source as a triple-quoted string literal inside a
//! small driver script, and the driver — running under the sandbox's own Python interpreter —
//! parses it, executes every statement but the last normally, and, if the last statement is a
//! bare expression, compiles it in `'single'` mode so its value is echoed to stdout exactly the
//! way a REPL or a Jupyter cell would.

/// Returns the program text to execute: `code` unchanged when `last_line_interactive` is false,
/// or `code` wrapped in the last-line-interactive driver otherwise.
pub fn code_to_execute(code: &str, last_line_interactive: bool) -> String {
    if last_line_interactive {
        wrap_last_line_interactive(code)
    } else {
        code.to_string()
    }
}

/// Embeds `code` into the last-line-interactive driver template.
///
/// Escaping mirrors the reference implementation exactly: backslashes are escaped first, then
/// single quotes, so the result is safe to splice into a Python `'''...'''` literal without the
/// embedded code being able to terminate it early.
pub fn wrap_last_line_interactive(code: &str) -> String {
    let escaped = code.replace('\\', "\\\\").replace('\'', "\\'");

    format!(
        r#"import ast
import sys

# User code
code = '''{escaped}'''

# Parse the code
tree = ast.parse(code)

# Execute all statements except the last one normally
if len(tree.body) > 0:
    for node in tree.body[:-1]:
        code_obj = compile(ast.Module(body=[node], type_ignores=[]), '<stdin>', 'exec')
        exec(code_obj)

    # For the last statement, check if it's an expression
    last_node = tree.body[-1]
    if isinstance(last_node, ast.Expr):
        # Execute in 'single' mode to print the result
        interactive = ast.Interactive(body=[last_node])
        ast.fix_missing_locations(interactive)
        code_obj = compile(interactive, '<stdin>', 'single')
        exec(code_obj)
    else:
        # Not an expression, execute normally
        code_obj = compile(ast.Module(body=[last_node], type_ignores=[]), '<stdin>', 'exec')
        exec(code_obj)
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_disabled() {
        assert_eq!(code_to_execute("print('hi')", false), "print('hi')");
    }

    #[test]
    fn wraps_and_embeds_source() {
        let wrapped = code_to_execute("1+1", true);
        assert!(wrapped.contains("code = '''1+1'''"));
        assert!(wrapped.contains("ast.parse(code)"));
    }

    #[test]
    fn escapes_backslashes_before_quotes() {
        let wrapped = wrap_last_line_interactive(r"a = '\n'");
        assert!(wrapped.contains(r"a = \'\\n\'"));
    }

    #[test]
    fn empty_program_wraps_to_empty_body() {
        let wrapped = wrap_last_line_interactive("");
        assert!(wrapped.contains("code = ''''''"));
        assert!(wrapped.contains("if len(tree.body) > 0:"));
    }
}
