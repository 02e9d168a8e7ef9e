//! Rendering of untrusted strings (paths recorded by backup jobs) for logs
//! and browse listings.

const MAX_DISPLAY_CHARS: usize = 1024;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    Osc,
    OscEsc,
    String,
    StringEsc,
}

impl Escape {
    /// Feeds one char; `None` once the sequence is over.
    fn step(self, c: char) -> Option<Escape> {
        match self {
            Escape::Start => match c {
                '[' => Some(Escape::Csi),
                ']' => Some(Escape::Osc),
                'P' | 'X' | '^' | '_' => Some(Escape::String),
                _ => None,
            },
            Escape::Csi => (!('@'..='~').contains(&c)).then_some(Escape::Csi),
            Escape::Osc => match c {
                '\x07' => None,
                '\x1b' => Some(Escape::OscEsc),
                _ => Some(Escape::Osc),
            },
            Escape::OscEsc => match c {
                '\\' => None,
                '\x1b' => Some(Escape::OscEsc),
                _ => Some(Escape::Osc),
            },
            Escape::String => Some(if c == '\x1b' {
                Escape::StringEsc
            } else {
                Escape::String
            }),
            Escape::StringEsc => match c {
                '\\' => None,
                '\x1b' => Some(Escape::StringEsc),
                _ => Some(Escape::String),
            },
        }
    }
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

pub fn sanitize_display(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_DISPLAY_CHARS));
    let mut escape: Option<Escape> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        if let Some(state) = escape {
            escape = state.step(c);
            continue;
        }
        match c {
            '\x1b' => {
                escape = Some(Escape::Start);
                continue;
            }
            '\t' => out.push(' '),
            c if c.is_control() || is_bidi_control(c) => continue,
            c => out.push(c),
        }
        kept += 1;
        if kept >= MAX_DISPLAY_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::sanitize_display;

    #[test]
    fn strips_terminal_sequences() {
        let got = sanitize_display("/data/\u{1b}[31mred\u{1b}[0m\u{1b}]0;t\u{7}.txt");
        assert_eq!(got, "/data/red.txt");
    }

    #[test]
    fn strips_controls_and_bidi() {
        assert_eq!(sanitize_display("a\tb\nc\u{202e}d"), "a bcd");
    }

    #[test]
    fn truncates_long_values() {
        let long = "x".repeat(5000);
        let got = sanitize_display(&long);
        assert!(got.ends_with("...[truncated]"));
        assert!(got.len() < 1100);
    }
}
