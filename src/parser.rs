//! Deserialize message bodies from the binary protocol.
use bytes::Bytes;
use nom::{
    IResult,
    bytes::complete::take,
    multi::many_m_n,
    number::complete::{be_i32, be_u8, be_u16},
};
use nombytes::NomBytes;
use uuid::Uuid;

use crate::constants::MAX_PROTOCOL_ARRAY_SIZE;
use crate::error::{Error, Result};

/// Convert bytes to a validated UTF-8 string.
/// Returns an error if the bytes are not valid UTF-8.
pub fn bytes_to_string(
    bytes: &Bytes,
) -> std::result::Result<String, nom::Err<nom::error::Error<NomBytes>>> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(
                NomBytes::from(bytes.as_ref()),
                nom::error::ErrorKind::Verify,
            ))
        })
}

/// Run `parser` over a whole body. Trailing bytes are tolerated so newer
/// servers can append fields.
pub fn parse_complete<O, F>(body: Bytes, mut parser: F) -> Result<O>
where
    F: FnMut(NomBytes) -> IResult<NomBytes, O>,
{
    match parser(NomBytes::new(body.clone())) {
        Ok((_, value)) => Ok(value),
        Err(_) => Err(Error::ParsingError(body)),
    }
}

pub fn parse_bool(s: NomBytes) -> IResult<NomBytes, bool> {
    let (s, b) = be_u8(s)?;
    Ok((s, b != 0))
}

/// Raw string bytes behind a `u16` length prefix.
pub fn parse_string(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_u16(s)?;
    let (s, string) = take(length)(s)?;
    Ok((s, string.into_bytes()))
}

/// UTF-8 string behind a `u16` length prefix.
pub fn parse_str(s: NomBytes) -> IResult<NomBytes, String> {
    let (s, raw) = parse_string(s)?;
    Ok((s, bytes_to_string(&raw)?))
}

/// `u16::MAX` as the length marks a null string.
pub fn parse_nullable_str(s: NomBytes) -> IResult<NomBytes, Option<String>> {
    let (s, length) = be_u16(s)?;
    if length == u16::MAX {
        return Ok((s, None));
    }
    let (s, raw) = take(length)(s)?;
    Ok((s, Some(bytes_to_string(&raw.into_bytes())?)))
}

/// Opaque blob behind an `i32` length prefix.
pub fn parse_bytes(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_i32(s)?;
    if length < 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    let (s, data) = take(length as usize)(s)?;
    Ok((s, data.into_bytes()))
}

pub fn parse_uuid(s: NomBytes) -> IResult<NomBytes, Uuid> {
    let (rest, raw) = take(16usize)(s)?;
    let raw = raw.into_bytes();
    match Uuid::from_slice(&raw) {
        Ok(id) => Ok((rest, id)),
        Err(_) => Err(nom::Err::Failure(nom::error::Error::new(
            rest,
            nom::error::ErrorKind::LengthValue,
        ))),
    }
}

pub fn parse_array<O, E, F>(f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: nom::error::ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let i = input.clone();
        let (i, length) = be_i32(i)?;

        // Null array
        if length == -1 {
            return Ok((i, vec![]));
        }

        if !(0..=MAX_PROTOCOL_ARRAY_SIZE).contains(&length) {
            return Err(nom::Err::Failure(E::from_error_kind(
                i,
                nom::error::ErrorKind::TooLarge,
            )));
        }

        many_m_n(length as usize, length as usize, f)(i)
    }
}
