//! CLI utilities for sigaccess.
//!
//! The utilities present in this module are used by the `sigaccess` binary to read commands
//! from a terminal and print fetched data blocks.
use std::{
    fmt::Write as _,
    io::{self, BufRead, Write},
};

use thiserror::Error;

use crate::{
    Command,
    command::CommandError,
    data::{DataBlock, ErrorStack, Values, with_values},
};

/// Values printed from each end of a long array.
const PREVIEW: usize = 5;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Prompt user for a command.
///
/// End of input reads as [`Command::Exit`].
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }
    Ok(s.as_str().try_into()?)
}

/// One-screen description of a data block.
pub fn summarize(block: &DataBlock) -> String {
    let mut out = String::new();
    let label = if block.data_label.is_empty() {
        "data"
    } else {
        &block.data_label
    };
    let _ = writeln!(
        out,
        "{label} [{:?}; {}] {}",
        block.data_type, block.data_n, block.data_units
    );
    if !block.data_desc.is_empty() {
        let _ = writeln!(out, "  {}", block.data_desc);
    }
    if let Some(values) = &block.data {
        let _ = writeln!(out, "  {}", preview(values));
    }
    for (i, dim) in block.dims.iter().enumerate() {
        let _ = write!(
            out,
            "  dim {i}: {} [{:?}; {}] {}",
            dim.label, dim.data_type, dim.dim_n, dim.units
        );
        match &dim.values {
            Some(values) => {
                let _ = writeln!(out, " {}", preview(values));
            }
            None => out.push('\n'),
        }
    }
    if block.errcode != 0 {
        let _ = writeln!(out, "  error {}: {}", block.errcode, block.error_msg);
    }
    out
}

/// Error stack rendered one record per line.
pub fn format_errors(errors: &ErrorStack) -> String {
    if errors.is_empty() {
        return "no errors\n".to_string();
    }
    errors.records().iter().fold(String::new(), |mut out, record| {
        let _ = writeln!(
            out,
            "{:?} {} in {}: {}",
            record.error_type, record.code, record.location, record.message
        );
        out
    })
}

fn preview(values: &Values) -> String {
    with_values!(values, v => {
        if v.len() <= PREVIEW * 2 {
            format!("{v:?}")
        } else {
            format!(
                "{:?} .. {:?}",
                &v[..PREVIEW],
                &v[v.len() - PREVIEW..]
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dim, ErrorRecord, ErrorType};

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_reads_commands() {
        let input = b"get ip 12345\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(
            res,
            Command::Get {
                signal: "ip".to_string(),
                source: "12345".to_string()
            }
        );
    }

    #[test]
    fn end_of_input_exits() {
        let mut output = Vec::new();
        assert_eq!(prompt(&b""[..], &mut output).unwrap(), Command::Exit);
    }

    #[test]
    #[should_panic(expected = "unrecognized command '.something_wrong'")]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();
    }

    #[test]
    fn long_arrays_are_shortened() {
        let block = DataBlock::new(Values::Int((0..20).collect()))
            .with_label("ramp", "V")
            .with_dim(Dim::new(Values::Double(vec![0.5, 1.5])).with_label("time", "s"));

        let text = summarize(&block);
        assert!(text.starts_with("ramp [Int; 20] V\n"));
        assert!(text.contains("[0, 1, 2, 3, 4] .. [15, 16, 17, 18, 19]"));
        assert!(text.contains("dim 0: time [Double; 2] s [0.5, 1.5]"));
    }

    #[test]
    fn errors_one_per_line() {
        let errors = ErrorStack::from(vec![
            ErrorRecord::new(ErrorType::Server, -1, "demo_signal", "unknown signal x"),
            ErrorRecord::new(ErrorType::System, 111, "create", "refused"),
        ]);
        let text = format_errors(&errors);
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("Server -1 in demo_signal: unknown signal x"));
    }
}
