//! threshold secret sharing (shamir) over GF(256)
//!
//! every secret byte is the constant term of its own random polynomial of
//! degree t-1. share `i` holds the evaluations at x = i for all bytes.

use rand::RngCore;
use zeroize::Zeroizing;

use crate::gf256;
use crate::keys::{MasterKey, KEY_LEN};
use crate::share::KeyShare;
use crate::{Error, Result};

/// largest share count, indices are non-zero bytes
pub const MAX_SHARES: usize = 255;

/// smallest meaningful threshold
pub const MIN_THRESHOLD: usize = 2;

/// check `2 <= t <= n <= 255`
pub fn validate_threshold(total: usize, threshold: usize) -> Result<()> {
    if threshold < MIN_THRESHOLD {
        return Err(Error::ConfigInvalid(format!(
            "threshold must be at least {}, got {}",
            MIN_THRESHOLD, threshold
        )));
    }
    if threshold > total {
        return Err(Error::ConfigInvalid(format!(
            "threshold ({}) cannot be greater than total shares ({})",
            threshold, total
        )));
    }
    if total > MAX_SHARES {
        return Err(Error::ConfigInvalid(format!(
            "at most {} shares are possible, got {}",
            MAX_SHARES, total
        )));
    }
    Ok(())
}

/// split `secret` into `total` shares, any `threshold` of which recover it
pub fn split(secret: &[u8], total: usize, threshold: usize) -> Result<Vec<KeyShare>> {
    validate_threshold(total, threshold)?;
    if secret.is_empty() {
        return Err(Error::ConfigInvalid("cannot split an empty secret".into()));
    }

    let mut rng = rand::thread_rng();
    let mut shares: Vec<KeyShare> = (1..=total)
        .map(|i| KeyShare::new(i as u8, vec![0u8; secret.len()]))
        .collect();

    let mut coeffs = Zeroizing::new(vec![0u8; threshold]);
    for (pos, &byte) in secret.iter().enumerate() {
        coeffs[0] = byte;
        rng.fill_bytes(&mut coeffs[1..]);

        for share in shares.iter_mut() {
            share.data[pos] = gf256::eval(&coeffs, share.index);
        }
    }

    Ok(shares)
}

/// interpolate a secret from the supplied shares.
///
/// every share is used. the threshold is not known here, so too few shares
/// produce a wrong secret rather than an error: check the result by using it.
pub fn combine(shares: &[KeyShare]) -> Result<Zeroizing<Vec<u8>>> {
    if shares.len() < MIN_THRESHOLD {
        return Err(Error::NotEnoughShares {
            have: shares.len(),
            need: MIN_THRESHOLD,
        });
    }

    let len = shares[0].data.len();
    let mut seen = [false; 256];
    for (pos, share) in shares.iter().enumerate() {
        if share.index == 0 {
            return Err(Error::InvalidShareIndex { position: pos + 1 });
        }
        if share.data.is_empty() || share.data.len() != len {
            return Err(Error::ShareDecode {
                position: pos + 1,
                reason: format!(
                    "share carries {} bytes, share #1 carries {}",
                    share.data.len(),
                    len
                ),
            });
        }
        if std::mem::replace(&mut seen[share.index as usize], true) {
            return Err(Error::DuplicateShareIndex(share.index));
        }
    }

    let xs: Vec<u8> = shares.iter().map(|s| s.index).collect();
    let mut ys = Zeroizing::new(vec![0u8; shares.len()]);
    let mut secret = Zeroizing::new(vec![0u8; len]);
    for (pos, out) in secret.iter_mut().enumerate() {
        for (y, share) in ys.iter_mut().zip(shares) {
            *y = share.data[pos];
        }
        *out = gf256::interpolate_at_zero(&xs, &ys);
    }

    Ok(secret)
}

/// combine shares and interpret the result as a master key
pub fn combine_key(shares: &[KeyShare]) -> Result<MasterKey> {
    let secret = combine(shares)?;
    let bytes: [u8; KEY_LEN] = secret.as_slice().try_into().map_err(|_| Error::ShareDecode {
        position: 1,
        reason: format!("shares carry {} bytes, a master key has {}", secret.len(), KEY_LEN),
    })?;
    Ok(MasterKey::from_bytes(bytes))
}
