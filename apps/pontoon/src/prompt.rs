use std::io::{self, BufRead, Write};

/// Interactive Yes/No confirmation. Implementations must tolerate being
/// called from async contexts; the terminal adapter blocks on stdin.
pub trait Prompt: Send + Sync {
    fn confirm(&self, question: &str, default_answer: bool) -> io::Result<bool>;
}

/// Asks on stdout, answers from stdin.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn confirm(&self, question: &str, default_answer: bool) -> io::Result<bool> {
        let stdin = io::stdin();
        let stdout = io::stdout();
        confirm_over(
            &mut stdin.lock(),
            &mut stdout.lock(),
            question,
            default_answer,
        )
    }
}

/// Prompt loop shared by the terminal adapter and tests. Renders
/// `"<question> [y/N]: "` (or `[n/Y]` when the default is yes), accepts
/// y/yes/n/no in any case, maps empty or closed input to the default, and
/// re-asks with the identical line on anything else.
pub fn confirm_over<R, W>(
    input: &mut R,
    output: &mut W,
    question: &str,
    default_answer: bool,
) -> io::Result<bool>
where
    R: BufRead,
    W: Write,
{
    let choices = if default_answer { "n/Y" } else { "y/N" };
    let mut line = String::new();

    loop {
        write!(output, "{question} [{choices}]: ")?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(default_answer);
        }

        match line.trim().to_ascii_lowercase().as_str() {
            "" => return Ok(default_answer),
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => {}
        }
    }
}
