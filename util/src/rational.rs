use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign};

use crate::error::{Error, Result};

/// Strictly positive rational number kept as an integer part plus a
/// reduced proper fraction, so frame rates such as 30000/1001 survive any
/// amount of scheduling arithmetic without drift.
///
/// Addition and multiplication cannot fail and are provided as operators;
/// subtraction and division can (negative result, zero divisor) and are
/// provided as checked methods returning `InvalidArgument`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    integer: u64,
    numerator: u64,
    denominator: u64,
}

impl Rational {
    pub const ZERO: Rational = Rational {
        integer: 0,
        numerator: 0,
        denominator: 1,
    };

    pub fn new(integer: u64, numerator: u64, denominator: u64) -> Result<Self> {
        if denominator == 0 {
            return Err(Error::invalid_argument(format!(
                "rational denominator cannot be zero: {integer} {numerator}/0"
            )));
        }
        let mut r = Rational {
            integer,
            numerator,
            denominator,
        };
        r.normalize();
        Ok(r)
    }

    pub const fn from_integer(integer: u64) -> Self {
        Rational {
            integer,
            numerator: 0,
            denominator: 1,
        }
    }

    pub fn from_ratio(numerator: u64, denominator: u64) -> Result<Self> {
        Rational::new(0, numerator, denominator)
    }

    pub fn integer(&self) -> u64 {
        self.integer
    }

    pub fn numerator(&self) -> u64 {
        self.numerator
    }

    pub fn denominator(&self) -> u64 {
        self.denominator
    }

    pub fn is_zero(&self) -> bool {
        self.integer == 0 && self.numerator == 0
    }

    /// Truncates towards zero.
    pub fn floor(&self) -> u64 {
        self.integer
    }

    pub fn to_f64(&self) -> f64 {
        self.integer as f64 + self.numerator as f64 / self.denominator as f64
    }

    fn normalize(&mut self) {
        reduce(&mut self.numerator, &mut self.denominator);
        let quotient = self.numerator / self.denominator;
        self.integer += quotient;
        self.numerator -= quotient * self.denominator;
    }

    pub fn checked_sub(&self, other: &Rational) -> Result<Rational> {
        let denominator = lcd(self.denominator, other.denominator);
        let mut numerator1 = self.numerator * (denominator / self.denominator);
        let numerator2 = other.numerator * (denominator / other.denominator);

        if self.integer < other.integer {
            return Err(Error::invalid_argument(format!(
                "negative rational: {self} - {other}"
            )));
        }
        let mut integer = self.integer - other.integer;
        if numerator1 < numerator2 {
            if integer < 1 {
                return Err(Error::invalid_argument(format!(
                    "negative rational: {self} - {other}"
                )));
            }
            // borrow one from the integer part
            integer -= 1;
            numerator1 += denominator;
        }
        Rational::new(integer, numerator1 - numerator2, denominator)
    }

    pub fn checked_div(&self, other: &Rational) -> Result<Rational> {
        if other.is_zero() {
            return Err(Error::invalid_argument(format!(
                "rational division by zero: {self} / {other}"
            )));
        }
        let mut numerator1 = self.improper_numerator();
        let mut denominator1 = self.denominator;
        let mut numerator2 = other.improper_numerator();
        let mut denominator2 = other.denominator;

        reduce(&mut numerator1, &mut numerator2);
        reduce(&mut denominator1, &mut denominator2);

        Rational::new(0, numerator1 * denominator2, denominator1 * numerator2)
    }

    fn improper_numerator(&self) -> u64 {
        self.integer * self.denominator + self.numerator
    }
}

impl Default for Rational {
    fn default() -> Self {
        Rational::ZERO
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.numerator == 0 {
            write!(f, "{}", self.integer)
        } else if self.integer == 0 {
            write!(f, "{}/{}", self.numerator, self.denominator)
        } else {
            write!(f, "{} {}/{}", self.integer, self.numerator, self.denominator)
        }
    }
}

impl Add for Rational {
    type Output = Rational;

    fn add(self, other: Rational) -> Rational {
        let denominator = lcd(self.denominator, other.denominator);
        let numerator1 = self.numerator * (denominator / self.denominator);
        let numerator2 = other.numerator * (denominator / other.denominator);
        let mut r = Rational {
            integer: self.integer + other.integer,
            numerator: numerator1 + numerator2,
            denominator,
        };
        r.normalize();
        r
    }
}

impl Add<u64> for Rational {
    type Output = Rational;

    fn add(self, other: u64) -> Rational {
        self + Rational::from_integer(other)
    }
}

impl AddAssign for Rational {
    fn add_assign(&mut self, other: Rational) {
        *self = *self + other;
    }
}

impl Mul for Rational {
    type Output = Rational;

    fn mul(self, other: Rational) -> Rational {
        let mut numerator1 = self.improper_numerator();
        let mut denominator1 = self.denominator;
        let mut numerator2 = other.improper_numerator();
        let mut denominator2 = other.denominator;

        // cross-reduce before multiplying to keep the factors small
        reduce(&mut numerator1, &mut denominator2);
        reduce(&mut numerator2, &mut denominator1);

        let mut r = Rational {
            integer: 0,
            numerator: numerator1 * numerator2,
            denominator: denominator1 * denominator2,
        };
        r.normalize();
        r
    }
}

impl Mul<u64> for Rational {
    type Output = Rational;

    fn mul(self, other: u64) -> Rational {
        self * Rational::from_integer(other)
    }
}

impl MulAssign for Rational {
    fn mul_assign(&mut self, other: Rational) {
        *self = *self * other;
    }
}

impl Div<u64> for Rational {
    type Output = Rational;

    fn div(self, other: u64) -> Rational {
        // dividing by a non-zero integer cannot fail
        let mut r = Rational {
            integer: 0,
            numerator: self.improper_numerator(),
            denominator: self.denominator * other,
        };
        r.normalize();
        r
    }
}

impl PartialOrd for Rational {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rational {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.integer != other.integer {
            return self.integer.cmp(&other.integer);
        }
        let common = lcd(self.denominator, other.denominator);
        let lhs = (common / self.denominator) as u128 * self.numerator as u128;
        let rhs = (common / other.denominator) as u128 * other.numerator as u128;
        lhs.cmp(&rhs)
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    if a < b {
        std::mem::swap(&mut a, &mut b);
    }
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

fn lcd(d1: u64, d2: u64) -> u64 {
    d1 / gcd(d1, d2) * d2
}

fn reduce(n: &mut u64, d: &mut u64) {
    if *n == 0 {
        return;
    }
    let r = gcd(*n, *d);
    *n /= r;
    *d /= r;
}
