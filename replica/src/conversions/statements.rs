/// Splits SQL text into individual statements.
///
/// Semicolons inside string literals, quoted identifiers, dollar quoted bodies and
/// comments do not end a statement. Returned statements are trimmed and carry no
/// trailing semicolon; empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ';' => {
                push_statement(&mut statements, &mut current);
                i += 1;
                continue;
            }
            '\'' => {
                let escapes = i > 0 && matches!(chars[i - 1], 'e' | 'E');
                i = copy_quoted(&chars, i, '\'', escapes, &mut current);
                continue;
            }
            '"' => {
                i = copy_quoted(&chars, i, '"', false, &mut current);
                continue;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    current.push(chars[i]);
                    i += 1;
                }
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i = copy_block_comment(&chars, i, &mut current);
                continue;
            }
            '$' => {
                if let Some(tag) = dollar_tag(&chars, i) {
                    i = copy_dollar_quoted(&chars, i, &tag, &mut current);
                    continue;
                }
            }
            _ => {}
        }

        current.push(c);
        i += 1;
    }

    push_statement(&mut statements, &mut current);

    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_owned());
    }
    current.clear();
}

fn copy_quoted(chars: &[char], start: usize, quote: char, escapes: bool, out: &mut String) -> usize {
    out.push(quote);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        if escapes && c == '\\' {
            if let Some(&next) = chars.get(i + 1) {
                out.push(next);
            }
            i += 2;
            continue;
        }
        if c == quote {
            // A doubled quote is an escaped quote.
            if chars.get(i + 1) == Some(&quote) {
                out.push(quote);
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }

    i
}

fn copy_block_comment(chars: &[char], start: usize, out: &mut String) -> usize {
    let mut depth = 0;
    let mut i = start;
    while i < chars.len() {
        if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
            depth += 1;
            out.push_str("/*");
            i += 2;
        } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
            depth -= 1;
            out.push_str("*/");
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }

    i
}

/// Returns the full opening tag (e.g. `$body$`) when a dollar quote starts at `start`.
fn dollar_tag(chars: &[char], start: usize) -> Option<String> {
    let mut i = start + 1;
    if let Some(first) = chars.get(i)
        && first.is_ascii_digit()
    {
        return None;
    }

    while let Some(&c) = chars.get(i) {
        if c == '$' {
            return Some(chars[start..=i].iter().collect());
        }
        if !(c.is_alphanumeric() || c == '_') {
            return None;
        }
        i += 1;
    }

    None
}

fn copy_dollar_quoted(chars: &[char], start: usize, tag: &str, out: &mut String) -> usize {
    let tag: Vec<char> = tag.chars().collect();
    out.extend(tag.iter());

    let mut i = start + tag.len();
    while i < chars.len() {
        if chars[i..].starts_with(&tag) {
            out.extend(tag.iter());
            return i + tag.len();
        }
        out.push(chars[i]);
        i += 1;
    }

    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_statements() {
        let statements = split_statements("alter table a add column x int; create index on a (x);\n");
        assert_eq!(
            statements,
            vec!["alter table a add column x int", "create index on a (x)"]
        );
    }

    #[test]
    fn ignores_semicolons_in_literals_and_comments() {
        let sql = "insert into t values ('a;b', E'c\\';d'); -- trailing; comment\n\
                   select \"odd;name\" from t /* x; /* nested; */ y */;";
        let statements = split_statements(sql);

        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "insert into t values ('a;b', E'c\\';d')");
        assert!(statements[1].starts_with("-- trailing; comment"));
        assert!(statements[1].ends_with("y */"));
    }

    #[test]
    fn keeps_dollar_quoted_bodies_whole() {
        let sql = "create function f() returns int as $body$ begin return 1; end; $body$ language plpgsql;\
                   select $1;";
        let statements = split_statements(sql);

        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("$body$ language plpgsql"));
        assert_eq!(statements[1], "select $1");
    }

    #[test]
    fn drops_empty_statements() {
        assert!(split_statements(" ; ;\n").is_empty());
    }
}
