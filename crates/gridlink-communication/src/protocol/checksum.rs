//! Checksum framing
//!
//! Checksummed commands go out as `N<line> <command>*<checksum>` where the
//! checksum is the XOR of every byte of `N<line> <command>`.

/// XOR of every byte of `s`
pub fn xor_checksum(s: &str) -> u8 {
    s.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Frame `command` with line number `lineno`
pub fn frame(command: &str, lineno: u64) -> String {
    let body = format!("N{} {}", lineno, command);
    let sum = xor_checksum(&body);
    format!("{}*{}", body, sum)
}

/// Split a framed line into line number, command and checksum, and check
/// that the checksum matches the body.
pub fn verify(framed: &str) -> Option<(u64, &str)> {
    let (body, sum) = framed.rsplit_once('*')?;
    let sum: u8 = sum.trim().parse().ok()?;
    if xor_checksum(body) != sum {
        return None;
    }
    let rest = body.strip_prefix('N')?;
    let (lineno, command) = rest.split_once(' ')?;
    Some((lineno.parse().ok()?, command))
}

/// Monotonic line number source. Starts at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumbers {
    next: u64,
}

impl Default for LineNumbers {
    fn default() -> Self {
        Self::new()
    }
}

impl LineNumbers {
    /// Counter starting at line 1
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Line number the next call to [`frame_next`](Self::frame_next) uses
    pub fn peek(&self) -> u64 {
        self.next
    }

    /// Restart numbering at 1
    pub fn reset(&mut self) {
        self.next = 1;
    }

    /// Frame `command` with the next line number and advance by one.
    pub fn frame_next(&mut self, command: &str) -> (String, u64) {
        let lineno = self.next;
        self.next += 1;
        (frame(command, lineno), lineno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_frame() {
        let framed = frame("M110 N0", 1);
        assert_eq!(framed, "N1 M110 N0*124");
        assert_eq!(verify(&framed), Some((1, "M110 N0")));
    }

    #[test]
    fn test_line_numbers_advance_by_one() {
        let mut numbers = LineNumbers::new();
        let (a, first) = numbers.frame_next("G28");
        let (b, second) = numbers.frame_next("M105");
        assert_eq!((first, second), (1, 2));
        assert!(a.starts_with("N1 G28*"));
        assert!(b.starts_with("N2 M105*"));
        numbers.reset();
        assert_eq!(numbers.peek(), 1);
    }

    #[test]
    fn test_corrupted_frame_fails_verification() {
        let framed = frame("G1 X10", 7).replace("X10", "X11");
        assert_eq!(verify(&framed), None);
    }

    proptest! {
        #[test]
        fn prop_checksum_round_trip(cmd in "[ -)+-~]{0,40}", lineno in 0u64..1_000_000) {
            let framed = frame(&cmd, lineno);
            let body = format!("N{} {}", lineno, cmd);
            let expected = body.bytes().fold(0u8, |a, b| a ^ b);
            prop_assert_eq!(framed.clone(), format!("{}*{}", body, expected));
            let (n, parsed) = verify(&framed).unwrap();
            prop_assert_eq!(n, lineno);
            prop_assert_eq!(parsed, cmd.as_str());
        }
    }
}
