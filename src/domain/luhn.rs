/// Validates a digit string with the Luhn checksum.
///
/// Every second digit counting from the rightmost one is doubled (subtracting 9
/// when the product exceeds 9) and the sum of all digits must be a multiple of 10.
/// Inputs shorter than two characters or containing anything but ASCII digits
/// are invalid.
pub fn is_valid(number: &str) -> bool {
    if number.len() < 2 {
        return false;
    }

    let mut sum = 0u32;
    for (position, byte) in number.bytes().rev().enumerate() {
        if !byte.is_ascii_digit() {
            return false;
        }
        let mut digit = u32::from(byte - b'0');
        if position % 2 == 1 {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
    }

    sum % 10 == 0
}
