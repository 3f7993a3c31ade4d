//! Parsing of human readable byte sizes ("512K", "2M", "1G").

use anyhow::{format_err, Error};

use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    combinator::{map, map_res, opt},
    sequence::pair,
};

use crate::nom::{parse_complete, parse_u64, IResult};

fn parse_suffix(i: &str) -> IResult<&str, u64> {
    alt((
        map(tag_no_case("k"), |_| 1024u64),
        map(tag_no_case("m"), |_| 1024u64 * 1024),
        map(tag_no_case("g"), |_| 1024u64 * 1024 * 1024),
    ))(i)
}

/// Parse a byte size with an optional binary `K`/`M`/`G` suffix.
pub fn parse_byte_size(input: &str) -> Result<u64, Error> {
    parse_complete(
        "byte size",
        input.trim(),
        map_res(pair(parse_u64, opt(parse_suffix)), |(value, scale)| {
            value
                .checked_mul(scale.unwrap_or(1))
                .ok_or_else(|| format_err!("byte size out of range"))
        }),
    )
}
