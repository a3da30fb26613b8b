//! PKCS#3 `DH PARAMETERS` encoding.
//!
//! The cache file holds `SEQUENCE { INTEGER prime, INTEGER base }` in DER,
//! wrapped in PEM armour, which is the format other MTA tooling reads.
//! Reading goes through x509-parser's PEM reader and der-parser; the writer
//! is small enough to keep here.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use x509_parser::der_parser::ber::BerObjectContent;
use x509_parser::der_parser::der::{parse_der_sequence, DerObject};
use x509_parser::error::PEMError;
use x509_parser::nom;
use x509_parser::pem::parse_x509_pem;

const PEM_LABEL: &str = "DH PARAMETERS";
const PEM_BEGIN: &str = "-----BEGIN DH PARAMETERS-----";
const PEM_END: &str = "-----END DH PARAMETERS-----";

const TAG_INTEGER: u8 = 0x02;
const TAG_SEQUENCE: u8 = 0x30;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Pkcs3Error {
    #[error("missing DH PARAMETERS armour")]
    Armour,
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("malformed DER: {0}")]
    Der(&'static str),
}

/// Prime and generator as unsigned big-endian integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParameters {
    pub prime: Vec<u8>,
    pub generator: Vec<u8>,
}

pub fn encode_pem(params: &DhParameters) -> String {
    let der = encode_der(params);
    let body = STANDARD.encode(der);

    let mut pem = String::with_capacity(body.len() + body.len() / 64 + 64);
    pem.push_str(PEM_BEGIN);
    pem.push('\n');
    for line in body.as_bytes().chunks(64) {
        // base64 output is ASCII
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(PEM_END);
    pem.push('\n');
    pem
}

pub fn decode_pem(input: &[u8]) -> Result<DhParameters, Pkcs3Error> {
    let (_, pem) = parse_x509_pem(input).map_err(|e| match e {
        nom::Err::Error(PEMError::Base64DecodeError) | nom::Err::Failure(PEMError::Base64DecodeError) => {
            Pkcs3Error::Base64(PEMError::Base64DecodeError.to_string())
        }
        _ => Pkcs3Error::Armour,
    })?;
    if pem.label != PEM_LABEL {
        return Err(Pkcs3Error::Armour);
    }
    decode_der(&pem.contents)
}

pub fn encode_der(params: &DhParameters) -> Vec<u8> {
    let mut content = Vec::new();
    write_integer(&mut content, &params.prime);
    write_integer(&mut content, &params.generator);

    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(TAG_SEQUENCE);
    write_length(&mut out, content.len());
    out.extend_from_slice(&content);
    out
}

pub fn decode_der(der: &[u8]) -> Result<DhParameters, Pkcs3Error> {
    let (rest, sequence) = parse_der_sequence(der).map_err(|_| Pkcs3Error::Der("malformed SEQUENCE"))?;
    if !rest.is_empty() {
        return Err(Pkcs3Error::Der("trailing data after SEQUENCE"));
    }
    let fields = sequence
        .as_sequence()
        .map_err(|_| Pkcs3Error::Der("malformed SEQUENCE"))?;

    // An optional privateValueLength may follow; it is not used.
    let (prime, generator) = match fields.as_slice() {
        [prime, generator] => (integer(prime)?, integer(generator)?),
        [prime, generator, length] => {
            integer(length)?;
            (integer(prime)?, integer(generator)?)
        }
        _ => return Err(Pkcs3Error::Der("unexpected fields in DH parameters")),
    };

    Ok(DhParameters {
        prime: unsigned(prime)?,
        generator: unsigned(generator)?,
    })
}

fn integer<'a>(object: &DerObject<'a>) -> Result<&'a [u8], Pkcs3Error> {
    match object.content {
        BerObjectContent::Integer(bytes) => Ok(bytes),
        _ => Err(Pkcs3Error::Der("unexpected tag")),
    }
}

fn write_integer(out: &mut Vec<u8>, value: &[u8]) {
    let first = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    let trimmed = &value[first..];
    let pad = trimmed.first().map_or(true, |b| b & 0x80 != 0);

    out.push(TAG_INTEGER);
    write_length(out, trimmed.len() + usize::from(pad));
    if pad {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
}

fn write_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    out.push(0x80 | (bytes.len() - first) as u8);
    out.extend_from_slice(&bytes[first..]);
}

fn unsigned(integer: &[u8]) -> Result<Vec<u8>, Pkcs3Error> {
    match integer.first() {
        None => Err(Pkcs3Error::Der("empty INTEGER")),
        Some(b) if b & 0x80 != 0 => Err(Pkcs3Error::Der("negative INTEGER")),
        Some(_) => {
            let first = integer.iter().position(|b| *b != 0).unwrap_or(integer.len() - 1);
            Ok(integer[first..].to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_high_bit_prime_with_padding() {
        let params = DhParameters {
            prime: vec![0xff, 0x01],
            generator: vec![0x02],
        };
        let der = encode_der(&params);
        assert_eq!(der, vec![0x30, 0x08, 0x02, 0x03, 0x00, 0xff, 0x01, 0x02, 0x01, 0x02]);
        assert_eq!(decode_der(&der).unwrap(), params);
    }

    #[test]
    fn long_form_lengths() {
        let params = DhParameters {
            prime: vec![0x7f; 300],
            generator: vec![0x02],
        };
        let pem = encode_pem(&params);
        assert!(pem.starts_with(PEM_BEGIN));
        assert!(pem.lines().all(|l| l.len() <= 64 || l.starts_with("-----")));
        assert_eq!(decode_pem(pem.as_bytes()).unwrap(), params);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(decode_pem(b"not a pem"), Err(Pkcs3Error::Armour));
        let other = encode_pem(&DhParameters {
            prime: vec![0x17],
            generator: vec![0x02],
        })
        .replace("DH PARAMETERS", "X9.42 DH PARAMETERS");
        assert_eq!(decode_pem(other.as_bytes()), Err(Pkcs3Error::Armour));
        let truncated = format!("{}\nMAg=\n{}\n", PEM_BEGIN, PEM_END);
        assert!(matches!(decode_pem(truncated.as_bytes()), Err(Pkcs3Error::Der(_))));
    }

    #[test]
    fn ignores_private_value_length() {
        let der = [0x30, 0x09, 0x02, 0x01, 0x17, 0x02, 0x01, 0x02, 0x02, 0x01, 0x40];
        let params = decode_der(&der).unwrap();
        assert_eq!(params.prime, vec![0x17]);
        assert_eq!(params.generator, vec![0x02]);

        let four = [0x30, 0x0c, 0x02, 0x01, 0x17, 0x02, 0x01, 0x02, 0x02, 0x01, 0x40, 0x02, 0x01, 0x01];
        assert!(matches!(decode_der(&four), Err(Pkcs3Error::Der(_))));
    }

    #[test]
    fn rejects_negative_prime() {
        let der = [0x30, 0x06, 0x02, 0x01, 0x80, 0x02, 0x01, 0x02];
        assert_eq!(decode_der(&der), Err(Pkcs3Error::Der("negative INTEGER")));
    }
}
