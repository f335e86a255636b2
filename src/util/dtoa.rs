//! Number to property-key conversion
//!
//! Number keys are canonicalized to the same string a script would see:
//! integers print without a fraction, `-0` prints as `"0"`, and large or
//! small magnitudes switch to exponent form. Digits come from the shortest
//! round-trip representation produced by `{:e}` formatting.

/// Write the decimal form of an array index into `buf`, returning the digits
pub fn u32_to_str(buf: &mut [u8; 10], mut val: u32) -> &[u8] {
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = b'0' + (val % 10) as u8;
        val /= 10;
        if val == 0 {
            break;
        }
    }
    &buf[i..]
}

/// Canonical string form of a number
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        // Whole numbers print exactly in this range
        return format!("{}", n as i128);
    }

    let sci = format!("{:e}", n.abs());
    let (mantissa, exp) = match sci.split_once('e') {
        Some(parts) => parts,
        None => return format!("{}", n),
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    let point = exp + 1;

    let mut out = String::new();
    if n < 0.0 {
        out.push('-');
    }

    if k <= point && point <= 21 {
        out.push_str(&digits);
        out.extend(std::iter::repeat_n('0', (point - k) as usize));
    } else if 0 < point && point <= 21 {
        out.push_str(&digits[..point as usize]);
        out.push('.');
        out.push_str(&digits[point as usize..]);
    } else if -6 < point && point <= 0 {
        out.push_str("0.");
        out.extend(std::iter::repeat_n('0', (-point) as usize));
        out.push_str(&digits);
    } else {
        out.push_str(&digits[..1]);
        if k > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        out.push('e');
        out.push(if point - 1 >= 0 { '+' } else { '-' });
        out.push_str(&(point - 1).abs().to_string());
    }
    out
}
