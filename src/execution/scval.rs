// ScVal encoding helpers for the handful of shapes the distributor speaks
use std::str::FromStr;

use stellar_xdr::curr::{
    Int128Parts, ScAddress, ScMap, ScMapEntry, ScSymbol, ScVal, ScVec, StringM, VecM,
};

use crate::error::GatewayError;

pub fn symbol(name: &str) -> Result<ScSymbol, GatewayError> {
    let inner = StringM::<32>::try_from(name.as_bytes().to_vec())
        .map_err(|_| GatewayError::Codec(format!("invalid symbol '{}'", name)))?;
    Ok(ScSymbol(inner))
}

pub fn address(strkey: &str) -> Result<ScVal, GatewayError> {
    Ok(ScVal::Address(parse_address(strkey)?))
}

pub fn parse_address(strkey: &str) -> Result<ScAddress, GatewayError> {
    ScAddress::from_str(strkey.trim())
        .map_err(|_| GatewayError::Codec(format!("invalid address '{}'", strkey)))
}

pub fn i128_val(value: i128) -> ScVal {
    ScVal::I128(Int128Parts {
        hi: (value >> 64) as i64,
        lo: value as u64,
    })
}

/// Chain amounts are i128; reject anything that would not fit
pub fn amount(value: u128) -> Result<ScVal, GatewayError> {
    let signed = i128::try_from(value)
        .map_err(|_| GatewayError::Codec(format!("amount {} exceeds i128", value)))?;
    Ok(i128_val(signed))
}

pub fn vec(items: Vec<ScVal>) -> Result<ScVal, GatewayError> {
    let inner: VecM<ScVal> = items.try_into()?;
    Ok(ScVal::Vec(Some(ScVec(inner))))
}

/// Struct encoding: a map keyed by field-name symbols, keys in sorted order
pub fn record(mut fields: Vec<(&str, ScVal)>) -> Result<ScVal, GatewayError> {
    fields.sort_by(|a, b| a.0.cmp(b.0));
    let entries = fields
        .into_iter()
        .map(|(key, val)| {
            Ok(ScMapEntry {
                key: ScVal::Symbol(symbol(key)?),
                val,
            })
        })
        .collect::<Result<Vec<_>, GatewayError>>()?;
    let inner: VecM<ScMapEntry> = entries.try_into()?;
    Ok(ScVal::Map(Some(ScMap(inner))))
}

pub fn to_i128(value: &ScVal) -> Result<i128, GatewayError> {
    match value {
        ScVal::I128(parts) => Ok(((parts.hi as i128) << 64) | (parts.lo as i128)),
        ScVal::U64(v) => Ok(*v as i128),
        ScVal::I64(v) => Ok(*v as i128),
        ScVal::U32(v) => Ok(*v as i128),
        ScVal::I32(v) => Ok(*v as i128),
        other => Err(GatewayError::UnexpectedReturn(format!(
            "expected i128, got {:?}",
            other
        ))),
    }
}

pub fn to_u32(value: &ScVal) -> Result<u32, GatewayError> {
    match value {
        ScVal::U32(v) => Ok(*v),
        other => Err(GatewayError::UnexpectedReturn(format!(
            "expected u32, got {:?}",
            other
        ))),
    }
}

pub fn to_address(value: &ScVal) -> Result<String, GatewayError> {
    match value {
        ScVal::Address(addr) => Ok(addr.to_string()),
        other => Err(GatewayError::UnexpectedReturn(format!(
            "expected address, got {:?}",
            other
        ))),
    }
}

pub fn to_vec(value: &ScVal) -> Result<&[ScVal], GatewayError> {
    match value {
        ScVal::Vec(Some(items)) => Ok(items.0.as_slice()),
        other => Err(GatewayError::UnexpectedReturn(format!(
            "expected vec, got {:?}",
            other
        ))),
    }
}

/// Read a field out of a struct-encoded map
pub fn field<'a>(value: &'a ScVal, name: &str) -> Result<&'a ScVal, GatewayError> {
    let key = ScVal::Symbol(symbol(name)?);
    match value {
        ScVal::Map(Some(map)) => map
            .0
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.val)
            .ok_or_else(|| GatewayError::UnexpectedReturn(format!("missing field '{}'", name))),
        other => Err(GatewayError::UnexpectedReturn(format!(
            "expected struct map, got {:?}",
            other
        ))),
    }
}

/// Decode `Vec<(Address, i128)>`
pub fn to_address_amounts(value: &ScVal) -> Result<Vec<(String, i128)>, GatewayError> {
    to_vec(value)?
        .iter()
        .map(|pair| match to_vec(pair)? {
            [who, how_much] => Ok((to_address(who)?, to_i128(how_much)?)),
            other => Err(GatewayError::UnexpectedReturn(format!(
                "expected (address, i128) pair, got {} elements",
                other.len()
            ))),
        })
        .collect()
}

/// Encode `Vec<(Address, i128)>`
pub fn address_amounts(pairs: &[(String, i128)]) -> Result<ScVal, GatewayError> {
    let items = pairs
        .iter()
        .map(|(who, how_much)| vec(vec![address(who)?, i128_val(*how_much)]))
        .collect::<Result<Vec<_>, _>>()?;
    vec(items)
}
