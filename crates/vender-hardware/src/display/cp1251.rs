//! Windows-1251 encoding for character LCD controllers with a Cyrillic
//! font in the upper half of the code table.

/// Code points for bytes `0x80..=0xbf`. Zero marks an unassigned slot.
const HIGH: [u16; 64] = [
    0x0402, 0x0403, 0x201a, 0x0453, 0x201e, 0x2026, 0x2020, 0x2021, //
    0x20ac, 0x2030, 0x0409, 0x2039, 0x040a, 0x040c, 0x040b, 0x040f, //
    0x0452, 0x2018, 0x2019, 0x201c, 0x201d, 0x2022, 0x2013, 0x2014, //
    0x0000, 0x2122, 0x0459, 0x203a, 0x045a, 0x045c, 0x045b, 0x045f, //
    0x00a0, 0x040e, 0x045e, 0x0408, 0x00a4, 0x0490, 0x00a6, 0x00a7, //
    0x0401, 0x00a9, 0x0404, 0x00ab, 0x00ac, 0x00ad, 0x00ae, 0x0407, //
    0x00b0, 0x00b1, 0x0406, 0x0456, 0x0491, 0x00b5, 0x00b6, 0x00b7, //
    0x0451, 0x2116, 0x0454, 0x00bb, 0x0458, 0x0405, 0x0455, 0x0457, //
];

/// Unmappable characters become `?`.
pub const REPLACEMENT: u8 = b'?';

pub fn encode_char(c: char) -> u8 {
    let cp = c as u32;
    match cp {
        0..=0x7f => cp as u8,
        0x0410..=0x044f => (cp - 0x0410 + 0xc0) as u8,
        _ => HIGH
            .iter()
            .position(|&h| h != 0 && u32::from(h) == cp)
            .map_or(REPLACEMENT, |i| 0x80 + i as u8),
    }
}

/// Encode a UTF-8 string.
///
/// ```
/// use vender_hardware::display::cp1251;
///
/// assert_eq!(cp1251::encode("Цена 5"), vec![0xd6, 0xe5, 0xed, 0xe0, b' ', b'5']);
/// ```
pub fn encode(s: &str) -> Vec<u8> {
    s.chars().map(encode_char).collect()
}

pub fn decode_byte(b: u8) -> char {
    match b {
        0..=0x7f => char::from(b),
        0xc0..=0xff => char::from_u32(u32::from(b - 0xc0) + 0x0410).unwrap_or('?'),
        _ => match HIGH[usize::from(b - 0x80)] {
            0 => '?',
            h => char::from_u32(u32::from(h)).unwrap_or('?'),
        },
    }
}

pub fn decode(b: &[u8]) -> String {
    b.iter().copied().map(decode_byte).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case('А', 0xc0)]
    #[case('я', 0xff)]
    #[case('Ё', 0xa8)]
    #[case('ё', 0xb8)]
    #[case('№', 0xb9)]
    #[case('€', 0x88)]
    #[case('~', b'~')]
    fn test_encode_char(#[case] c: char, #[case] b: u8) {
        assert_eq!(encode_char(c), b);
        assert_eq!(decode_byte(b), c);
    }

    #[test]
    fn test_unmappable() {
        assert_eq!(encode("a€漢"), vec![b'a', 0x88, b'?']);
        assert_eq!(decode_byte(0x98), '?');
    }

    proptest! {
        #[test]
        fn prop_cyrillic_roundtrip(s in "[а-яА-ЯёЁ0-9 a-z]{0,40}") {
            prop_assert_eq!(decode(&encode(&s)), s);
        }
    }
}
