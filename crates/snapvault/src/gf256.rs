//! arithmetic in GF(2^8) with the AES polynomial (x^8 + x^4 + x^3 + x + 1)
//!
//! addition and subtraction are both xor.

/// exp/log tables over the generator 0x03, which has order 255.
/// `EXP[255]` wraps to `EXP[0]` so `255 - log` needs no reduction.
struct Tables {
    exp: [u8; 256],
    log: [u8; 256],
}

const fn build_tables() -> Tables {
    let mut exp = [0u8; 256];
    let mut log = [0u8; 256];
    let mut x: u8 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x;
        log[x as usize] = i as u8;
        // x * 3 = x * 2 ^ x, with the doubling reduced mod the polynomial
        let doubled = (x << 1) ^ if x & 0x80 != 0 { 0x1b } else { 0 };
        x = doubled ^ x;
        i += 1;
    }
    exp[255] = exp[0];
    Tables { exp, log }
}

static TABLES: Tables = build_tables();

/// multiply two field elements
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let sum = TABLES.log[a as usize] as usize + TABLES.log[b as usize] as usize;
    TABLES.exp[sum % 255]
}

/// multiplicative inverse. zero maps to zero.
pub fn inv(a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    TABLES.exp[255 - TABLES.log[a as usize] as usize]
}

/// a / b. callers must not divide by zero.
pub fn div(a: u8, b: u8) -> u8 {
    debug_assert!(b != 0, "division by zero in GF(256)");
    mul(a, inv(b))
}

/// evaluate a polynomial (constant term first) at x using horner's rule
pub fn eval(coeffs: &[u8], x: u8) -> u8 {
    coeffs.iter().rev().fold(0u8, |acc, &c| mul(acc, x) ^ c)
}

/// lagrange interpolation at x = 0. `xs` must be distinct and non-zero,
/// `ys[i]` is the value at `xs[i]`.
pub fn interpolate_at_zero(xs: &[u8], ys: &[u8]) -> u8 {
    debug_assert_eq!(xs.len(), ys.len());
    let mut result = 0u8;

    for (i, (&xi, &yi)) in xs.iter().zip(ys).enumerate() {
        let mut num = 1u8;
        let mut den = 1u8;

        for (j, &xj) in xs.iter().enumerate() {
            if i != j {
                num = mul(num, xj); // (0 - xj) = xj
                den = mul(den, xi ^ xj); // (xi - xj)
            }
        }

        result ^= mul(yi, div(num, den));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_known_values() {
        assert_eq!(mul(0, 0), 0);
        assert_eq!(mul(1, 1), 1);
        assert_eq!(mul(2, 2), 4);
        // fips-197 example: {57} x {83} = {c1}
        assert_eq!(mul(0x57, 0x83), 0xc1);
    }

    #[test]
    fn test_tables_agree_with_shift_and_add() {
        fn slow_mul(mut a: u8, mut b: u8) -> u8 {
            let mut acc = 0u8;
            while b != 0 {
                if b & 1 == 1 {
                    acc ^= a;
                }
                a = (a << 1) ^ if a & 0x80 != 0 { 0x1b } else { 0 };
                b >>= 1;
            }
            acc
        }
        for a in 0..=255u8 {
            for b in 0..=255u8 {
                assert_eq!(mul(a, b), slow_mul(a, b), "{} * {}", a, b);
            }
        }
    }

    #[test]
    fn test_generator_covers_field() {
        let mut seen = [false; 256];
        for &e in &TABLES.exp[..255] {
            assert!(!seen[e as usize], "{} repeated", e);
            seen[e as usize] = true;
        }
        assert!(!seen[0]);
    }

    #[test]
    fn test_inverse() {
        for a in 1..=255u8 {
            assert_eq!(mul(a, inv(a)), 1, "inverse failed for {}", a);
        }
        assert_eq!(inv(0), 0);
    }

    #[test]
    fn test_eval_matches_naive() {
        let coeffs = [0x2a, 0x11, 0xfe];
        for x in 0..=255u8 {
            let naive = coeffs[0] ^ mul(coeffs[1], x) ^ mul(coeffs[2], mul(x, x));
            assert_eq!(eval(&coeffs, x), naive);
        }
    }

    #[test]
    fn test_interpolate_line() {
        // f(x) = 7 + 3x
        let coeffs = [7u8, 3u8];
        let xs = [1u8, 200u8];
        let ys = [eval(&coeffs, 1), eval(&coeffs, 200)];
        assert_eq!(interpolate_at_zero(&xs, &ys), 7);
    }
}
